//! Unified fact store: long-lived knowledge about users and chats with
//! confidence, evidence, append-only versioning, and soft deletes.
//!
//! `add_fact` is the quality-controlled entry point (reinforce, semantic
//! merge, conflict resolution). `update_fact` is the explicit bypass for
//! admin-initiated corrections and never runs the quality rules.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use balachka_core::types::{
    cosine_similarity, epoch_now, Entity, Fact, FactCategory, FactChange, FactVersion,
};

use crate::db::{embedding_from_json, embedding_to_json, fts_quote, Database};
use crate::error::{Result, StoreError};

/// Evidence excerpts merged past this length are truncated; the newest
/// excerpt is always kept whole.
const MAX_EVIDENCE_CHARS: usize = 500;

/// A candidate fact entering the store.
#[derive(Debug, Clone)]
pub struct NewFact {
    pub entity: Entity,
    pub chat_context: Option<i64>,
    pub category: FactCategory,
    pub key: String,
    pub value: String,
    pub confidence: f64,
    pub evidence_text: String,
    pub source_message_id: Option<i64>,
    pub embedding: Option<Vec<f32>>,
    /// When the supporting message was observed — drives the conflict rule.
    pub observed_at: i64,
}

/// What `add_fact` did with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Created(i64),
    Reinforced(i64),
    /// The old fact was superseded by a newly created one.
    Superseded { old: i64, new: i64 },
    /// Conflict resolution rejected the candidate.
    Dropped,
}

/// Per-category exponential decay rate per day. Identity-grade facts decay
/// slowly; conversational topics fade within weeks.
pub fn default_decay_rate(category: FactCategory) -> f64 {
    match category {
        FactCategory::Personal | FactCategory::Language | FactCategory::Culture => 0.001,
        FactCategory::Location | FactCategory::Relationship => 0.004,
        FactCategory::Skill | FactCategory::Trait | FactCategory::Style => 0.008,
        FactCategory::Preference | FactCategory::Interest | FactCategory::Norm => 0.01,
        FactCategory::Rule => 0.0,
        FactCategory::Topic => 0.05,
    }
}

pub struct FactStore {
    db: Arc<Database>,
    /// Embedding cosine at or above which two facts are the same fact.
    duplicate_threshold: f64,
}

impl FactStore {
    pub fn new(db: Arc<Database>, duplicate_threshold: f64) -> Self {
        Self {
            db,
            duplicate_threshold,
        }
    }

    /// Quality-controlled insert. Exact key match reinforces; semantic
    /// near-match (cosine ≥ threshold, same entity + category) reinforces;
    /// a conflicting value either supersedes the old fact (newer and at
    /// least 90% as confident) or is dropped.
    pub fn add_fact(&self, new: &NewFact) -> Result<AddOutcome> {
        let key = crate::normalize::normalize_key(&new.key);
        let value = crate::normalize::normalize_value(new.category, &new.value);
        let conn = self.db.lock();

        if let Some(existing) = find_active(&conn, new.entity, new.category, &key)? {
            if existing.value == value {
                reinforce(&conn, &existing, new)?;
                return Ok(AddOutcome::Reinforced(existing.id));
            }
            // Same key, different value: conflict.
            let newer = new.observed_at > existing.updated_at;
            let confident_enough = new.confidence >= existing.confidence * 0.9;
            if newer && confident_enough {
                deactivate(&conn, &existing, FactChange::Superseded)?;
                let id = insert_fact(&conn, new, &key, &value)?;
                info!(
                    old_fact = existing.id,
                    new_fact = id,
                    key = %key,
                    "fact superseded"
                );
                return Ok(AddOutcome::Superseded {
                    old: existing.id,
                    new: id,
                });
            }
            debug!(fact = existing.id, key = %key, "conflicting candidate dropped");
            return Ok(AddOutcome::Dropped);
        }

        if let Some(embedding) = new.embedding.as_deref() {
            if let Some(near) =
                find_semantic_match(&conn, new.entity, new.category, embedding, self.duplicate_threshold)?
            {
                reinforce(&conn, &near, new)?;
                return Ok(AddOutcome::Reinforced(near.id));
            }
        }

        let id = insert_fact(&conn, new, &key, &value)?;
        Ok(AddOutcome::Created(id))
    }

    /// Force-write a new value and/or confidence. No dedup, no conflict
    /// rule — reserved for explicit admin or update tooling.
    pub fn update_fact(
        &self,
        fact_id: i64,
        new_value: Option<&str>,
        new_confidence: Option<f64>,
        change: FactChange,
    ) -> Result<()> {
        let conn = self.db.lock();
        let fact = get_by_id(&conn, fact_id)?;

        let value = new_value
            .map(|v| crate::normalize::normalize_value(fact.category, v))
            .unwrap_or_else(|| fact.value.clone());
        let confidence = new_confidence.unwrap_or(fact.confidence).clamp(0.0, 1.0);
        let now = epoch_now();

        conn.execute(
            "UPDATE facts SET value = ?1, confidence = ?2, updated_at = ?3 WHERE id = ?4",
            params![value, confidence, now, fact_id],
        )?;
        sync_fts(&conn, fact_id, &fact.key, &fact.value, Some((&fact.key, &value)))?;
        append_version(
            &conn,
            fact_id,
            change,
            confidence - fact.confidence,
            Some(&fact.value),
            Some(&value),
            now,
        )?;
        Ok(())
    }

    /// Soft-delete one fact; the version log gains a final Deleted row.
    pub fn forget_fact(&self, fact_id: i64) -> Result<()> {
        let conn = self.db.lock();
        let fact = get_by_id(&conn, fact_id)?;
        if !fact.active {
            return Ok(());
        }
        deactivate(&conn, &fact, FactChange::Deleted)?;
        Ok(())
    }

    /// Soft-delete every active fact for an entity. Returns how many.
    pub fn forget_all(&self, entity: Entity) -> Result<usize> {
        let facts = self.get_facts(entity, None, None, None)?;
        let conn = self.db.lock();
        for fact in &facts {
            deactivate(&conn, fact, FactChange::Deleted)?;
        }
        info!(entity = ?entity, count = facts.len(), "all facts forgotten");
        Ok(facts.len())
    }

    /// Active facts for an entity, ordered by effective (decayed)
    /// confidence, optionally filtered by category and a confidence floor.
    pub fn get_facts(
        &self,
        entity: Entity,
        category: Option<FactCategory>,
        min_confidence: Option<f64>,
        limit: Option<usize>,
    ) -> Result<Vec<Fact>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, entity_kind, entity_id, chat_context, category, key,
                    value, confidence, evidence_count, evidence_text,
                    source_message_id, embedding, decay_rate, created_at,
                    updated_at, active
             FROM facts
             WHERE entity_kind = ?1 AND entity_id = ?2 AND active = 1
               AND (?3 IS NULL OR category = ?3)",
        )?;
        let rows = stmt.query_map(
            params![
                entity.kind(),
                entity.id(),
                category.map(|c| c.to_string())
            ],
            row_to_fact,
        )?;

        let now = epoch_now();
        let mut facts: Vec<Fact> = rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|f| {
                min_confidence
                    .map(|floor| f.effective_confidence(now) >= floor)
                    .unwrap_or(true)
            })
            .collect();
        facts.sort_by(|a, b| {
            b.effective_confidence(now)
                .partial_cmp(&a.effective_confidence(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(limit) = limit {
            facts.truncate(limit);
        }
        Ok(facts)
    }

    /// Most recently touched active facts for an entity.
    pub fn get_recent(&self, entity: Entity, limit: usize) -> Result<Vec<Fact>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, entity_kind, entity_id, chat_context, category, key,
                    value, confidence, evidence_count, evidence_text,
                    source_message_id, embedding, decay_rate, created_at,
                    updated_at, active
             FROM facts
             WHERE entity_kind = ?1 AND entity_id = ?2 AND active = 1
             ORDER BY updated_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![entity.kind(), entity.id(), limit as i64],
            row_to_fact,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Full-text search across an entity's active facts.
    pub fn search(&self, entity: Entity, query: &str, limit: usize) -> Result<Vec<Fact>> {
        let quoted = fts_quote(query);
        if quoted.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT f.id, f.entity_kind, f.entity_id, f.chat_context, f.category,
                    f.key, f.value, f.confidence, f.evidence_count, f.evidence_text,
                    f.source_message_id, f.embedding, f.decay_rate, f.created_at,
                    f.updated_at, f.active
             FROM facts f
             JOIN facts_fts ff ON f.id = ff.rowid
             WHERE f.entity_kind = ?1 AND f.entity_id = ?2 AND f.active = 1
               AND facts_fts MATCH ?3
             ORDER BY rank
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![entity.kind(), entity.id(), quoted, limit as i64],
            row_to_fact,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Full version history of one fact, oldest first.
    pub fn history(&self, fact_id: i64) -> Result<Vec<FactVersion>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, fact_id, change, confidence_delta, prior_value,
                    new_value, created_at
             FROM fact_versions WHERE fact_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map([fact_id], |row| {
            let change: String = row.get(2)?;
            Ok(FactVersion {
                id: row.get(0)?,
                fact_id: row.get(1)?,
                change: change.parse().unwrap_or(FactChange::Created),
                confidence_delta: row.get(3)?,
                prior_value: row.get(4)?,
                new_value: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Look up the active fact for (entity, category, key), if any.
    pub fn find(
        &self,
        entity: Entity,
        category: FactCategory,
        key: &str,
    ) -> Result<Option<Fact>> {
        let conn = self.db.lock();
        find_active(&conn, entity, category, &crate::normalize::normalize_key(key))
    }
}

fn get_by_id(conn: &Connection, fact_id: i64) -> Result<Fact> {
    conn.query_row(
        "SELECT id, entity_kind, entity_id, chat_context, category, key,
                value, confidence, evidence_count, evidence_text,
                source_message_id, embedding, decay_rate, created_at,
                updated_at, active
         FROM facts WHERE id = ?1",
        [fact_id],
        row_to_fact,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound {
        what: format!("fact {fact_id}"),
    })
}

fn find_active(
    conn: &Connection,
    entity: Entity,
    category: FactCategory,
    key: &str,
) -> Result<Option<Fact>> {
    let fact = conn
        .query_row(
            "SELECT id, entity_kind, entity_id, chat_context, category, key,
                    value, confidence, evidence_count, evidence_text,
                    source_message_id, embedding, decay_rate, created_at,
                    updated_at, active
             FROM facts
             WHERE entity_kind = ?1 AND entity_id = ?2 AND category = ?3
               AND key = ?4 AND active = 1",
            params![entity.kind(), entity.id(), category.to_string(), key],
            row_to_fact,
        )
        .optional()?;
    Ok(fact)
}

fn find_semantic_match(
    conn: &Connection,
    entity: Entity,
    category: FactCategory,
    embedding: &[f32],
    threshold: f64,
) -> Result<Option<Fact>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_kind, entity_id, chat_context, category, key,
                value, confidence, evidence_count, evidence_text,
                source_message_id, embedding, decay_rate, created_at,
                updated_at, active
         FROM facts
         WHERE entity_kind = ?1 AND entity_id = ?2 AND category = ?3
           AND active = 1 AND embedding IS NOT NULL",
    )?;
    let rows = stmt.query_map(
        params![entity.kind(), entity.id(), category.to_string()],
        row_to_fact,
    )?;

    let mut best: Option<(f64, Fact)> = None;
    for fact in rows {
        let fact = fact?;
        let Some(candidate) = fact.embedding.as_deref() else {
            continue;
        };
        let sim = cosine_similarity(embedding, candidate);
        if sim >= threshold && best.as_ref().map(|(s, _)| sim > *s).unwrap_or(true) {
            best = Some((sim, fact));
        }
    }
    Ok(best.map(|(_, f)| f))
}

fn insert_fact(conn: &Connection, new: &NewFact, key: &str, value: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO facts
         (entity_kind, entity_id, chat_context, category, key, value,
          confidence, evidence_count, evidence_text, source_message_id,
          embedding, decay_rate, created_at, updated_at, active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10, ?11, ?12, ?12, 1)",
        params![
            new.entity.kind(),
            new.entity.id(),
            new.chat_context,
            new.category.to_string(),
            key,
            value,
            new.confidence.clamp(0.0, 1.0),
            new.evidence_text,
            new.source_message_id,
            embedding_to_json(new.embedding.as_deref()),
            default_decay_rate(new.category),
            new.observed_at,
        ],
    )?;
    let id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO facts_fts(rowid, key, value) VALUES (?1, ?2, ?3)",
        params![id, key, value],
    )?;
    append_version(
        conn,
        id,
        FactChange::Created,
        new.confidence,
        None,
        Some(value),
        new.observed_at,
    )?;
    Ok(id)
}

/// Re-observation of a known fact: confidence ratchets up, never down;
/// evidence count grows; excerpts merge.
fn reinforce(conn: &Connection, existing: &Fact, new: &NewFact) -> Result<()> {
    let confidence = existing.confidence.max(new.confidence.clamp(0.0, 1.0));
    let evidence = merge_evidence(&existing.evidence_text, &new.evidence_text);
    let now = epoch_now();
    conn.execute(
        "UPDATE facts SET confidence = ?1, evidence_count = evidence_count + 1,
                evidence_text = ?2, updated_at = ?3
         WHERE id = ?4",
        params![confidence, evidence, now, existing.id],
    )?;
    append_version(
        conn,
        existing.id,
        FactChange::Reinforced,
        confidence - existing.confidence,
        Some(&existing.value),
        Some(&existing.value),
        now,
    )?;
    debug!(fact = existing.id, confidence, "fact reinforced");
    Ok(())
}

fn deactivate(conn: &Connection, fact: &Fact, change: FactChange) -> Result<()> {
    let now = epoch_now();
    conn.execute(
        "UPDATE facts SET active = 0, updated_at = ?1 WHERE id = ?2",
        params![now, fact.id],
    )?;
    sync_fts(conn, fact.id, &fact.key, &fact.value, None)?;
    append_version(
        conn,
        fact.id,
        change,
        0.0,
        Some(&fact.value),
        None,
        now,
    )?;
    Ok(())
}

fn append_version(
    conn: &Connection,
    fact_id: i64,
    change: FactChange,
    confidence_delta: f64,
    prior_value: Option<&str>,
    new_value: Option<&str>,
    created_at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO fact_versions
         (fact_id, change, confidence_delta, prior_value, new_value, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            fact_id,
            change.to_string(),
            confidence_delta,
            prior_value,
            new_value,
            created_at,
        ],
    )?;
    Ok(())
}

/// Remove the old FTS entry for a fact; re-insert when `reinsert` carries
/// the replacement (key, value).
fn sync_fts(
    conn: &Connection,
    fact_id: i64,
    old_key: &str,
    old_value: &str,
    reinsert: Option<(&str, &str)>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO facts_fts(facts_fts, rowid, key, value)
         VALUES('delete', ?1, ?2, ?3)",
        params![fact_id, old_key, old_value],
    )?;
    if let Some((key, value)) = reinsert {
        conn.execute(
            "INSERT INTO facts_fts(rowid, key, value) VALUES (?1, ?2, ?3)",
            params![fact_id, key, value],
        )?;
    }
    Ok(())
}

fn merge_evidence(existing: &str, incoming: &str) -> String {
    let incoming = incoming.trim();
    if incoming.is_empty() || existing.contains(incoming) {
        return existing.to_string();
    }
    let merged = if existing.is_empty() {
        incoming.to_string()
    } else {
        format!("{existing}; {incoming}")
    };
    if merged.chars().count() > MAX_EVIDENCE_CHARS {
        // Keep the tail — newest evidence matters most.
        let skip = merged.chars().count() - MAX_EVIDENCE_CHARS;
        merged.chars().skip(skip).collect()
    } else {
        merged
    }
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let kind: String = row.get(1)?;
    let category: String = row.get(4)?;
    Ok(Fact {
        id: row.get(0)?,
        entity: Entity::from_kind(&kind, row.get(2)?).unwrap_or(Entity::User(0)),
        chat_context: row.get(3)?,
        category: category.parse().unwrap_or(FactCategory::Personal),
        key: row.get(5)?,
        value: row.get(6)?,
        confidence: row.get(7)?,
        evidence_count: row.get(8)?,
        evidence_text: row.get(9)?,
        source_message_id: row.get(10)?,
        embedding: embedding_from_json(row.get(11)?),
        decay_rate: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        active: row.get::<_, i64>(15)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FactStore {
        FactStore::new(Database::open_in_memory().unwrap(), 0.85)
    }

    fn candidate(value: &str, confidence: f64, observed_at: i64) -> NewFact {
        NewFact {
            entity: Entity::User(42),
            chat_context: None,
            category: FactCategory::Personal,
            key: "location".into(),
            value: value.into(),
            confidence,
            evidence_text: String::new(),
            source_message_id: None,
            embedding: None,
            observed_at,
        }
    }

    #[test]
    fn repeat_observation_reinforces() {
        let store = store();
        let mut first = candidate("Kyiv", 0.8, 1_000);
        first.evidence_text = "я з Києва".into();
        assert!(matches!(
            store.add_fact(&first).unwrap(),
            AddOutcome::Created(_)
        ));

        let mut second = candidate("Kyiv", 0.7, 2_000);
        second.evidence_text = "knew it".into();
        let outcome = store.add_fact(&second).unwrap();
        assert!(matches!(outcome, AddOutcome::Reinforced(_)));

        let facts = store.get_facts(Entity::User(42), None, None, None).unwrap();
        assert_eq!(facts.len(), 1);
        // higher confidence wins, evidence accumulates
        assert!((facts[0].confidence - 0.8).abs() < 1e-9);
        assert_eq!(facts[0].evidence_count, 2);
        assert!(facts[0].evidence_text.contains("knew it"));

        let history = store.history(facts[0].id).unwrap();
        let changes: Vec<FactChange> = history.iter().map(|v| v.change).collect();
        assert_eq!(changes, vec![FactChange::Created, FactChange::Reinforced]);
    }

    #[test]
    fn normalized_variants_hit_the_same_fact() {
        let store = store();
        store.add_fact(&candidate("Kiev", 0.8, 1_000)).unwrap();
        let outcome = store.add_fact(&candidate("КИЇВ", 0.6, 2_000)).unwrap();
        assert!(matches!(outcome, AddOutcome::Reinforced(_)));
        let facts = store.get_facts(Entity::User(42), None, None, None).unwrap();
        assert_eq!(facts[0].value, "kyiv");
    }

    #[test]
    fn newer_confident_value_supersedes() {
        let store = store();
        store.add_fact(&candidate("Kyiv", 0.8, 1_000)).unwrap();
        let outcome = store
            .add_fact(&candidate("Lviv", 0.9, epoch_now() + 86_400))
            .unwrap();
        let AddOutcome::Superseded { old, new } = outcome else {
            panic!("expected supersede, got {outcome:?}");
        };

        let facts = store.get_facts(Entity::User(42), None, None, None).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].id, new);
        assert_eq!(facts[0].value, "lviv");

        let old_history = store.history(old).unwrap();
        assert_eq!(
            old_history.last().unwrap().change,
            FactChange::Superseded
        );
    }

    #[test]
    fn weak_conflicting_value_is_dropped() {
        let store = store();
        store.add_fact(&candidate("Kyiv", 0.9, 1_000)).unwrap();
        let outcome = store
            .add_fact(&candidate("Lviv", 0.3, epoch_now() + 86_400))
            .unwrap();
        assert_eq!(outcome, AddOutcome::Dropped);
        let facts = store.get_facts(Entity::User(42), None, None, None).unwrap();
        assert_eq!(facts[0].value, "kyiv");
    }

    #[test]
    fn semantic_near_match_reinforces() {
        let store = store();
        let mut first = candidate("loves metal", 0.7, 1_000);
        first.key = "music_taste".into();
        first.category = FactCategory::Preference;
        first.embedding = Some(vec![1.0, 0.0, 0.0]);
        store.add_fact(&first).unwrap();

        let mut close = candidate("enjoys heavy metal", 0.6, 2_000);
        close.key = "music_preference".into();
        close.category = FactCategory::Preference;
        close.embedding = Some(vec![0.99, 0.05, 0.0]);
        let outcome = store.add_fact(&close).unwrap();
        assert!(matches!(outcome, AddOutcome::Reinforced(_)));

        let facts = store.get_facts(Entity::User(42), None, None, None).unwrap();
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn forget_is_soft_and_versioned() {
        let store = store();
        store.add_fact(&candidate("Kyiv", 0.8, 1_000)).unwrap();
        let fact = store.find(Entity::User(42), FactCategory::Personal, "location")
            .unwrap()
            .unwrap();
        store.forget_fact(fact.id).unwrap();

        assert!(store
            .get_facts(Entity::User(42), None, None, None)
            .unwrap()
            .is_empty());
        let history = store.history(fact.id).unwrap();
        assert_eq!(history.last().unwrap().change, FactChange::Deleted);
        // row still exists physically
        let conn = store.db.lock();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM facts WHERE id = ?1", [fact.id], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn forget_all_clears_entity() {
        let store = store();
        store.add_fact(&candidate("Kyiv", 0.8, 1_000)).unwrap();
        let mut other = candidate("uk", 0.9, 1_000);
        other.key = "native_language".into();
        other.category = FactCategory::Language;
        store.add_fact(&other).unwrap();

        assert_eq!(store.forget_all(Entity::User(42)).unwrap(), 2);
        assert!(store
            .get_facts(Entity::User(42), None, None, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn active_uniqueness_allows_recreate_after_forget() {
        let store = store();
        store.add_fact(&candidate("Kyiv", 0.8, 1_000)).unwrap();
        let fact = store.find(Entity::User(42), FactCategory::Personal, "location")
            .unwrap()
            .unwrap();
        store.forget_fact(fact.id).unwrap();
        // same (entity, category, key) can exist again once the old row is inactive
        let outcome = store.add_fact(&candidate("Lviv", 0.7, 2_000)).unwrap();
        assert!(matches!(outcome, AddOutcome::Created(_)));
    }

    #[test]
    fn update_fact_bypasses_quality_rules() {
        let store = store();
        store.add_fact(&candidate("Kyiv", 0.9, 1_000)).unwrap();
        let fact = store.find(Entity::User(42), FactCategory::Personal, "location")
            .unwrap()
            .unwrap();
        // a low-confidence correction would be dropped by add_fact
        store
            .update_fact(fact.id, Some("Bakhmach"), Some(0.4), FactChange::Corrected)
            .unwrap();

        let facts = store.get_facts(Entity::User(42), None, None, None).unwrap();
        assert_eq!(facts[0].value, "bakhmach");
        assert!((facts[0].confidence - 0.4).abs() < 1e-9);
        let history = store.history(fact.id).unwrap();
        assert_eq!(history.last().unwrap().change, FactChange::Corrected);
    }

    #[test]
    fn search_matches_key_and_value() {
        let store = store();
        let mut fact = candidate("rust", 0.8, 1_000);
        fact.key = "favourite_language".into();
        fact.category = FactCategory::Preference;
        store.add_fact(&fact).unwrap();

        let hits = store.search(Entity::User(42), "rust", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.search(Entity::User(42), "golang", 5).unwrap().is_empty());
        assert!(store.search(Entity::User(99), "rust", 5).unwrap().is_empty());
    }

    #[test]
    fn chat_entities_are_separate_from_users() {
        let store = store();
        let mut chat_fact = candidate("jokes welcome", 0.8, 1_000);
        chat_fact.entity = Entity::Chat(-10099);
        chat_fact.category = FactCategory::Norm;
        chat_fact.key = "tone".into();
        store.add_fact(&chat_fact).unwrap();

        assert_eq!(
            store
                .get_facts(Entity::Chat(-10099), None, None, None)
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .get_facts(Entity::User(-10099), None, None, None)
            .unwrap()
            .is_empty());
    }
}
