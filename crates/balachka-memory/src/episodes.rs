//! Episodic store: durable summaries of closed conversation windows,
//! retrievable by recency or by semantic similarity to a query.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use balachka_core::types::{cosine_similarity, Episode, Valence};

use crate::db::{embedding_from_json, embedding_to_json, Database};
use crate::error::{Result, StoreError};

/// An episode about to be persisted.
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub participant_ids: Vec<i64>,
    pub topic: String,
    pub summary: String,
    pub valence: Valence,
    pub tags: Vec<String>,
    pub message_ids: Vec<i64>,
    pub importance: f64,
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

pub struct EpisodeStore {
    db: Arc<Database>,
}

impl EpisodeStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist one episode. The message-id list must be non-empty and
    /// strictly increasing — it is the retention pruner's exclusion set.
    pub fn insert(&self, episode: &NewEpisode) -> Result<i64> {
        if episode.message_ids.is_empty() {
            return Err(StoreError::InvalidRow(
                "episode without message ids".to_string(),
            ));
        }
        if episode.message_ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StoreError::InvalidRow(
                "episode message ids must be strictly increasing".to_string(),
            ));
        }

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO episodes
             (chat_id, thread_id, participant_ids, topic, summary, valence,
              tags, message_ids, importance, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                episode.chat_id,
                episode.thread_id,
                serde_json::to_string(&episode.participant_ids)?,
                episode.topic,
                episode.summary,
                episode.valence.to_string(),
                serde_json::to_string(&episode.tags)?,
                serde_json::to_string(&episode.message_ids)?,
                episode.importance.clamp(0.0, 1.0),
                embedding_to_json(episode.embedding.as_deref()),
                episode.created_at,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(episode_id = id, chat_id = episode.chat_id, topic = %episode.topic, "episode stored");
        Ok(id)
    }

    pub fn get(&self, episode_id: i64) -> Result<Episode> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT id, chat_id, thread_id, participant_ids, topic, summary,
                    valence, tags, message_ids, importance, embedding, created_at
             FROM episodes WHERE id = ?1",
            [episode_id],
            row_to_episode,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            what: format!("episode {episode_id}"),
        })
    }

    /// Most recent episodes for a chat (and optionally one thread).
    pub fn by_chat(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, thread_id, participant_ids, topic, summary,
                    valence, tags, message_ids, importance, embedding, created_at
             FROM episodes
             WHERE chat_id = ?1 AND (?2 IS NULL OR thread_id IS ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![chat_id, thread_id, limit as i64], row_to_episode)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Episodes of one chat ranked by cosine similarity to the query
    /// embedding, weighted by stored importance. Episodes without an
    /// embedding are ranked by importance alone, after the embedded ones.
    pub fn semantic(
        &self,
        chat_id: i64,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(f64, Episode)>> {
        let episodes = self.by_chat(chat_id, None, 200)?;
        let mut scored: Vec<(f64, Episode)> = episodes
            .into_iter()
            .map(|ep| {
                let score = match ep.embedding.as_deref() {
                    Some(embedding) => {
                        cosine_similarity(query_embedding, embedding) * (0.5 + 0.5 * ep.importance)
                    }
                    None => 0.1 * ep.importance,
                };
                (score, ep)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let participants: String = row.get(3)?;
    let valence: String = row.get(6)?;
    let tags: String = row.get(7)?;
    let message_ids: String = row.get(8)?;
    Ok(Episode {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        thread_id: row.get(2)?,
        participant_ids: serde_json::from_str(&participants).unwrap_or_default(),
        topic: row.get(4)?,
        summary: row.get(5)?,
        valence: valence.parse().unwrap_or(Valence::Neutral),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        message_ids: serde_json::from_str(&message_ids).unwrap_or_default(),
        importance: row.get(9)?,
        embedding: embedding_from_json(row.get(10)?),
        created_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> EpisodeStore {
        EpisodeStore::new(Database::open_in_memory().unwrap())
    }

    fn episode(chat_id: i64, message_ids: Vec<i64>) -> NewEpisode {
        NewEpisode {
            chat_id,
            thread_id: None,
            participant_ids: vec![42, 43],
            topic: "weekend plans".into(),
            summary: "Talked about hiking near Lviv.".into(),
            valence: Valence::Positive,
            tags: vec!["travel".into()],
            message_ids,
            importance: 0.6,
            embedding: None,
            created_at: 1_000,
        }
    }

    #[test]
    fn insert_and_get_round_trips() {
        let store = store();
        let id = store.insert(&episode(1, vec![10, 11, 15])).unwrap();
        let ep = store.get(id).unwrap();
        assert_eq!(ep.message_ids, vec![10, 11, 15]);
        assert_eq!(ep.valence, Valence::Positive);
        assert_eq!(ep.participant_ids, vec![42, 43]);
    }

    #[test]
    fn rejects_empty_or_unordered_message_ids() {
        let store = store();
        assert!(store.insert(&episode(1, vec![])).is_err());
        assert!(store.insert(&episode(1, vec![5, 5])).is_err());
        assert!(store.insert(&episode(1, vec![9, 3])).is_err());
    }

    #[test]
    fn semantic_ranks_by_similarity() {
        let store = store();
        let mut about_food = episode(1, vec![1, 2, 3]);
        about_food.topic = "borshch".into();
        about_food.embedding = Some(vec![1.0, 0.0]);
        let mut about_code = episode(1, vec![4, 5, 6]);
        about_code.topic = "rust".into();
        about_code.embedding = Some(vec![0.0, 1.0]);
        store.insert(&about_food).unwrap();
        store.insert(&about_code).unwrap();
        // other chat must never appear
        store.insert(&episode(2, vec![7, 8, 9])).unwrap();

        let hits = store.semantic(1, &[0.9, 0.1], 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1.topic, "borshch");
    }
}
