//! Cross-store flows over one shared database: retention vs episodes,
//! fact lifecycle invariants, external-id fidelity.

use std::collections::BTreeMap;
use std::sync::Arc;

use balachka_core::types::{epoch_now, Entity, ExternalIds, FactCategory, FactChange, Role, Valence};
use balachka_memory::conversation::{ConversationStore, NewTurn};
use balachka_memory::db::Database;
use balachka_memory::episodes::{EpisodeStore, NewEpisode};
use balachka_memory::facts::{AddOutcome, FactStore, NewFact};

fn turn(chat_id: i64, text: &str, at: i64) -> NewTurn {
    NewTurn {
        chat_id,
        thread_id: None,
        user_id: 42,
        role: Role::User,
        text: text.to_string(),
        media: Vec::new(),
        metadata: BTreeMap::new(),
        external: ExternalIds::default(),
        embedding: None,
        created_at: at,
    }
}

#[test]
fn prune_never_touches_episode_messages() {
    let db = Database::open_in_memory().unwrap();
    let messages = ConversationStore::new(Arc::clone(&db));
    let episodes = EpisodeStore::new(Arc::clone(&db));
    let now = epoch_now();

    let m1 = messages
        .add_turn(&turn(1, "ten days old", now - 10 * 86_400))
        .unwrap();
    let m2 = messages.add_turn(&turn(1, "one day old", now - 86_400)).unwrap();

    episodes
        .insert(&NewEpisode {
            chat_id: 1,
            thread_id: None,
            participant_ids: vec![42],
            topic: "old talk".into(),
            summary: "An old conversation.".into(),
            valence: Valence::Neutral,
            tags: vec![],
            message_ids: vec![m1],
            importance: 0.5,
            embedding: None,
            created_at: now - 10 * 86_400,
        })
        .unwrap();

    let deleted = messages.prune(7).unwrap();
    assert_eq!(deleted, 0);
    assert!(messages.get(m1).is_ok());
    assert!(messages.get(m2).is_ok());

    // every episode message id still resolves after the prune
    for episode in episodes.by_chat(1, None, 10).unwrap() {
        for id in episode.message_ids {
            assert!(messages.get(id).is_ok(), "episode message {id} was pruned");
        }
    }
}

#[test]
fn external_id_survives_the_full_round_trip_as_string() {
    let db = Database::open_in_memory().unwrap();
    let messages = ConversationStore::new(db);
    // i64::MAX — a value JSON f64 numbers cannot represent exactly
    let huge = i64::MAX.to_string();

    let mut t = turn(1, "precision test", 1_000);
    t.external.message_id = Some(huge.clone());
    t.external.user_id = Some("9007199254740993".to_string());
    messages.add_turn(&t).unwrap();

    let found = messages.by_external_id(&huge).unwrap().unwrap();
    assert_eq!(found.external.message_id.as_deref(), Some(huge.as_str()));
    assert_eq!(
        found.external.user_id.as_deref(),
        Some("9007199254740993")
    );
}

#[test]
fn active_facts_stay_unique_per_key_through_every_path() {
    let db = Database::open_in_memory().unwrap();
    let facts = FactStore::new(db, 0.85);
    let entity = Entity::User(42);
    let now = epoch_now();

    let base = NewFact {
        entity,
        chat_context: None,
        category: FactCategory::Personal,
        key: "location".into(),
        value: "Kyiv".into(),
        confidence: 0.8,
        evidence_text: "я з Києва".into(),
        source_message_id: None,
        embedding: None,
        observed_at: now - 86_400,
    };

    // create, reinforce, supersede
    facts.add_fact(&base).unwrap();
    facts.add_fact(&NewFact {
        confidence: 0.7,
        ..base.clone()
    })
    .unwrap();
    let outcome = facts
        .add_fact(&NewFact {
            value: "Lviv".into(),
            confidence: 0.9,
            observed_at: now,
            ..base.clone()
        })
        .unwrap();
    assert!(matches!(outcome, AddOutcome::Superseded { .. }));

    let active = facts.get_facts(entity, None, None, None).unwrap();
    assert_eq!(active.len(), 1, "uniqueness violated: {active:?}");
    assert_eq!(active[0].value, "lviv");
    assert!((active[0].confidence - 0.9).abs() < 1e-9);

    // the superseded fact's history ends with Superseded, the new one starts with Created
    let all_versions: Vec<FactChange> = {
        let mut v = Vec::new();
        for fact_id in 1..=2 {
            for version in facts.history(fact_id).unwrap() {
                v.push(version.change);
            }
        }
        v
    };
    assert!(all_versions.contains(&FactChange::Superseded));
    assert!(all_versions.contains(&FactChange::Reinforced));
}

#[test]
fn interleaved_writes_and_reads_never_tear() {
    let db = Database::open_in_memory().unwrap();
    let store = Arc::new(ConversationStore::new(db));

    let mut writers = Vec::new();
    for worker in 0..4i64 {
        let store = Arc::clone(&store);
        writers.push(std::thread::spawn(move || {
            for i in 0..25i64 {
                store
                    .add_turn(&turn(1, &format!("worker {worker} message {i}"), 1_000 + i))
                    .unwrap();
            }
        }));
    }
    let reader = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for _ in 0..50 {
                let messages = store.recent(1, None, 60).unwrap();
                // every snapshot is internally consistent: unique ids in
                // (created_at, id) order
                let keys: Vec<(i64, i64)> =
                    messages.iter().map(|m| (m.created_at, m.id)).collect();
                let mut sorted = keys.clone();
                sorted.sort_unstable();
                sorted.dedup();
                assert_eq!(keys, sorted, "torn read: {keys:?}");
            }
        })
    };
    for writer in writers {
        writer.join().unwrap();
    }
    reader.join().unwrap();

    // all committed writes are visible afterwards
    assert_eq!(store.recent(1, None, 60).unwrap().len(), 100);
}

#[test]
fn forget_then_get_excludes_fact_and_logs_deletion() {
    let db = Database::open_in_memory().unwrap();
    let facts = FactStore::new(db, 0.85);
    let entity = Entity::User(7);

    facts
        .add_fact(&NewFact {
            entity,
            chat_context: None,
            category: FactCategory::Preference,
            key: "coffee".into(),
            value: "espresso".into(),
            confidence: 0.9,
            evidence_text: String::new(),
            source_message_id: None,
            embedding: None,
            observed_at: epoch_now(),
        })
        .unwrap();

    let fact = facts
        .find(entity, FactCategory::Preference, "coffee")
        .unwrap()
        .unwrap();
    facts.forget_fact(fact.id).unwrap();

    assert!(facts.get_facts(entity, None, None, None).unwrap().is_empty());
    let history = facts.history(fact.id).unwrap();
    assert_eq!(history.last().unwrap().change, FactChange::Deleted);
}
