//! Conversation store: every message the bot observes, addressed or not.
//!
//! Insert-only for message content; embeddings are backfilled after the
//! fact. Retention pruning is the single deletion path and honours episode
//! references and per-message importance overrides.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use balachka_core::types::{
    epoch_now, ExternalIds, MediaDescriptor, MessageRecord, Role,
};

use crate::db::{embedding_from_json, embedding_to_json, Database};
use crate::error::{Result, StoreError};

/// Ids per DELETE statement during pruning. Keeps every statement short and
/// the connection available between batches.
const PRUNE_BATCH: usize = 500;

/// A message about to be persisted (no internal id yet).
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub user_id: i64,
    pub role: Role,
    pub text: String,
    pub media: Vec<MediaDescriptor>,
    pub metadata: BTreeMap<String, String>,
    pub external: ExternalIds,
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

pub struct ConversationStore {
    db: Arc<Database>,
}

impl ConversationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist one message and sync the FTS index. Returns the internal id,
    /// the only join key the rest of the engine uses.
    pub fn add_turn(&self, turn: &NewTurn) -> Result<i64> {
        let conn = self.db.lock();
        let media = serde_json::to_string(&turn.media)?;
        let metadata = serde_json::to_string(&turn.metadata)?;
        let embedding = embedding_to_json(turn.embedding.as_deref());

        conn.execute(
            "INSERT INTO messages
             (chat_id, thread_id, user_id, role, text, media, metadata,
              embedding, created_at, external_message_id, external_user_id,
              reply_to_message_id, reply_to_user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                turn.chat_id,
                turn.thread_id,
                turn.user_id,
                turn.role.to_string(),
                turn.text,
                media,
                metadata,
                embedding,
                turn.created_at,
                turn.external.message_id,
                turn.external.user_id,
                turn.external.reply_to_message_id,
                turn.external.reply_to_user_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO messages_fts(rowid, text) VALUES (?1, ?2)",
            params![id, turn.text],
        )?;
        debug!(message_id = id, chat_id = turn.chat_id, "message stored");
        Ok(id)
    }

    /// Fetch up to `max_turns` conversation turns (a user message plus the
    /// model reply), i.e. `2 × max_turns` rows, newest first from the
    /// database and chronological on return. Equal timestamps order by id
    /// ascending.
    pub fn recent(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        max_turns: usize,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, thread_id, user_id, role, text, media,
                    metadata, embedding, created_at, external_message_id,
                    external_user_id, reply_to_message_id, reply_to_user_id
             FROM messages
             WHERE chat_id = ?1 AND thread_id IS ?2
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![chat_id, thread_id, (max_turns * 2) as i64],
            row_to_message,
        )?;
        let mut messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Look a message up by its transport-assigned id. The dedicated column
    /// is authoritative; rows written before that column existed carry the
    /// id only inside the metadata blob.
    pub fn by_external_id(&self, external_message_id: &str) -> Result<Option<MessageRecord>> {
        let conn = self.db.lock();
        match find_by_external_id(&conn, external_message_id)? {
            Some(id) => Ok(Some(self.get_locked(&conn, id)?)),
            None => Ok(None),
        }
    }

    /// Delete one message by external id (moderation path). Returns whether
    /// a row was removed.
    pub fn delete_by_external_id(&self, external_message_id: &str) -> Result<bool> {
        let conn = self.db.lock();
        let Some(id) = find_by_external_id(&conn, external_message_id)? else {
            return Ok(false);
        };
        delete_ids(&conn, &[id])?;
        info!(message_id = id, external_message_id, "message deleted");
        Ok(true)
    }

    pub fn get(&self, message_id: i64) -> Result<MessageRecord> {
        let conn = self.db.lock();
        self.get_locked(&conn, message_id)
    }

    fn get_locked(&self, conn: &Connection, message_id: i64) -> Result<MessageRecord> {
        conn.query_row(
            "SELECT id, chat_id, thread_id, user_id, role, text, media,
                    metadata, embedding, created_at, external_message_id,
                    external_user_id, reply_to_message_id, reply_to_user_id
             FROM messages WHERE id = ?1",
            [message_id],
            row_to_message,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            what: format!("message {message_id}"),
        })
    }

    /// Backfill the embedding of an already-stored message.
    pub fn set_embedding(&self, message_id: i64, embedding: &[f32]) -> Result<()> {
        let conn = self.db.lock();
        let n = conn.execute(
            "UPDATE messages SET embedding = ?1 WHERE id = ?2",
            params![embedding_to_json(Some(embedding)), message_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: format!("message {message_id}"),
            });
        }
        Ok(())
    }

    /// Dimension of any stored message embedding, for the startup check
    /// against the embedding model's output size.
    pub fn any_embedding_dim(&self) -> Result<Option<usize>> {
        let conn = self.db.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT embedding FROM messages WHERE embedding IS NOT NULL LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw
            .and_then(|s| serde_json::from_str::<Vec<f32>>(&s).ok())
            .map(|v| v.len()))
    }

    /// Messages still waiting for an embedding, oldest first.
    pub fn unembedded(&self, limit: usize) -> Result<Vec<(i64, String)>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, text FROM messages
             WHERE embedding IS NULL AND text != ''
             ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Record (or update) the importance of a message, optionally with a
    /// retention override in days.
    pub fn set_importance(
        &self,
        message_id: i64,
        importance: f64,
        retention_days: Option<u32>,
    ) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO message_importance (message_id, importance, retention_days)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(message_id) DO UPDATE SET
                importance = excluded.importance,
                retention_days = excluded.retention_days",
            params![message_id, importance, retention_days],
        )?;
        Ok(())
    }

    /// Delete messages older than `retention_days`, excluding anything an
    /// episode references and anything whose importance row grants a longer
    /// retention. Deletes run in batches of [`PRUNE_BATCH`] ids; no long
    /// transaction is held.
    pub fn prune(&self, retention_days: u32) -> Result<usize> {
        let now = epoch_now();
        let cutoff = now - retention_days as i64 * 86_400;

        let doomed: Vec<i64> = {
            let conn = self.db.lock();
            let protected = episode_message_ids(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT m.id, m.created_at, mi.retention_days
                 FROM messages m
                 LEFT JOIN message_importance mi ON mi.message_id = m.id
                 WHERE m.created_at < ?1",
            )?;
            let rows = stmt.query_map([cutoff], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            })?;

            let mut doomed = Vec::new();
            for row in rows {
                let (id, created_at, override_days) = row?;
                if protected.contains(&id) {
                    continue;
                }
                if let Some(days) = override_days {
                    if created_at >= now - days * 86_400 {
                        continue;
                    }
                }
                doomed.push(id);
            }
            doomed
        };

        let mut deleted = 0;
        for chunk in doomed.chunks(PRUNE_BATCH) {
            let conn = self.db.lock();
            deleted += delete_ids(&conn, chunk)?;
        }
        if deleted > 0 {
            info!(deleted, retention_days, "retention prune complete");
        }
        Ok(deleted)
    }
}

/// Every message id referenced by any episode. These survive pruning
/// unconditionally.
fn episode_message_ids(conn: &Connection) -> Result<HashSet<i64>> {
    let mut stmt = conn.prepare("SELECT message_ids FROM episodes")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut ids = HashSet::new();
    for raw in rows {
        let list: Vec<i64> = serde_json::from_str(&raw?)?;
        ids.extend(list);
    }
    Ok(ids)
}

fn find_by_external_id(conn: &Connection, external_message_id: &str) -> Result<Option<i64>> {
    let direct: Option<i64> = conn
        .query_row(
            "SELECT id FROM messages WHERE external_message_id = ?1",
            [external_message_id],
            |row| row.get(0),
        )
        .optional()?;
    if direct.is_some() {
        return Ok(direct);
    }
    // Legacy rows predate the dedicated column; the id lives in metadata.
    let legacy: Option<i64> = conn
        .query_row(
            "SELECT id FROM messages
             WHERE external_message_id IS NULL
               AND json_extract(metadata, '$.external_message_id') = ?1",
            [external_message_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(legacy)
}

/// Remove rows plus their FTS and importance entries.
fn delete_ids(conn: &Connection, ids: &[i64]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");

    // External-content FTS needs an explicit delete with the old values.
    conn.execute(
        &format!(
            "INSERT INTO messages_fts(messages_fts, rowid, text)
             SELECT 'delete', id, text FROM messages WHERE id IN ({placeholders})"
        ),
        rusqlite::params_from_iter(ids.iter()),
    )?;
    conn.execute(
        &format!("DELETE FROM message_importance WHERE message_id IN ({placeholders})"),
        rusqlite::params_from_iter(ids.iter()),
    )?;
    let n = conn.execute(
        &format!("DELETE FROM messages WHERE id IN ({placeholders})"),
        rusqlite::params_from_iter(ids.iter()),
    )?;
    Ok(n)
}

pub(crate) fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role: String = row.get(4)?;
    let media: String = row.get(6)?;
    let metadata: String = row.get(7)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        thread_id: row.get(2)?,
        user_id: row.get(3)?,
        role: role.parse().unwrap_or(Role::User),
        text: row.get(5)?,
        media: serde_json::from_str(&media).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        embedding: embedding_from_json(row.get(8)?),
        created_at: row.get(9)?,
        external: ExternalIds {
            message_id: row.get(10)?,
            user_id: row.get(11)?,
            reply_to_message_id: row.get(12)?,
            reply_to_user_id: row.get(13)?,
        },
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use balachka_core::types::{MediaKind, MediaPayload};

    pub(crate) fn turn(chat_id: i64, user_id: i64, text: &str, at: i64) -> NewTurn {
        NewTurn {
            chat_id,
            thread_id: None,
            user_id,
            role: Role::User,
            text: text.to_string(),
            media: Vec::new(),
            metadata: BTreeMap::new(),
            external: ExternalIds::default(),
            embedding: None,
            created_at: at,
        }
    }

    fn store() -> ConversationStore {
        ConversationStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn add_then_fetch_round_trips() {
        let store = store();
        let mut t = turn(7, 42, "привіт", 1_000);
        t.external.message_id = Some("9223372036854775807".to_string());
        t.media.push(MediaDescriptor {
            kind: MediaKind::Image,
            mime: "image/jpeg".into(),
            size_bytes: None,
            payload: MediaPayload::Uri {
                uri: "https://example.com/x.jpg".into(),
            },
            caption: Some("кіт".into()),
        });
        let id = store.add_turn(&t).unwrap();

        let found = store
            .by_external_id("9223372036854775807")
            .unwrap()
            .expect("stored message");
        assert_eq!(found.id, id);
        assert_eq!(found.text, "привіт");
        assert_eq!(found.media.len(), 1);
        // full 64-bit id fidelity, string end-to-end
        assert_eq!(
            found.external.message_id.as_deref(),
            Some("9223372036854775807")
        );
    }

    #[test]
    fn by_external_id_falls_back_to_metadata() {
        let store = store();
        let mut t = turn(7, 42, "legacy row", 1_000);
        t.metadata
            .insert("external_message_id".into(), "555".into());
        let id = store.add_turn(&t).unwrap();

        let found = store.by_external_id("555").unwrap().expect("legacy hit");
        assert_eq!(found.id, id);
        assert!(store.by_external_id("556").unwrap().is_none());
    }

    #[test]
    fn recent_returns_chronological_pairs() {
        let store = store();
        for i in 0..10 {
            let mut t = turn(1, 42, &format!("msg {i}"), 1_000 + i);
            if i % 2 == 1 {
                t.role = Role::Model;
            }
            store.add_turn(&t).unwrap();
        }
        // 2 turns = 4 rows, newest pairs, chronological order
        let recent = store.recent(1, None, 2).unwrap();
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].text, "msg 6");
        assert_eq!(recent[3].text, "msg 9");
    }

    #[test]
    fn recent_breaks_timestamp_ties_by_id() {
        let store = store();
        for i in 0..4 {
            store.add_turn(&turn(1, 42, &format!("m{i}"), 500)).unwrap();
        }
        let recent = store.recent(1, None, 2).unwrap();
        let ids: Vec<i64> = recent.iter().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn threads_are_separate_conversations() {
        let store = store();
        store.add_turn(&turn(1, 42, "general", 1_000)).unwrap();
        let mut threaded = turn(1, 42, "in thread", 1_001);
        threaded.thread_id = Some(99);
        store.add_turn(&threaded).unwrap();

        let general = store.recent(1, None, 5).unwrap();
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].text, "general");
        let thread = store.recent(1, Some(99), 5).unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].text, "in thread");
    }

    #[test]
    fn delete_by_external_id_removes_row() {
        let store = store();
        let mut t = turn(1, 42, "to delete", 1_000);
        t.external.message_id = Some("777".into());
        store.add_turn(&t).unwrap();

        assert!(store.delete_by_external_id("777").unwrap());
        assert!(!store.delete_by_external_id("777").unwrap());
        assert!(store.by_external_id("777").unwrap().is_none());
    }

    #[test]
    fn prune_respects_episodes_and_importance() {
        let db = Database::open_in_memory().unwrap();
        let store = ConversationStore::new(Arc::clone(&db));
        let now = epoch_now();

        let old_in_episode = store
            .add_turn(&turn(1, 42, "ten days old, in episode", now - 10 * 86_400))
            .unwrap();
        let old_plain = store
            .add_turn(&turn(1, 42, "ten days old", now - 10 * 86_400))
            .unwrap();
        let old_important = store
            .add_turn(&turn(1, 42, "old but important", now - 10 * 86_400))
            .unwrap();
        let fresh = store.add_turn(&turn(1, 42, "fresh", now - 86_400)).unwrap();

        store.set_importance(old_important, 0.9, Some(30)).unwrap();
        {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO episodes (chat_id, topic, summary, message_ids, created_at)
                 VALUES (1, 't', 's', ?1, ?2)",
                params![format!("[{old_in_episode}]"), now],
            )
            .unwrap();
        }

        let deleted = store.prune(7).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(old_in_episode).is_ok());
        assert!(store.get(old_important).is_ok());
        assert!(store.get(fresh).is_ok());
        assert!(store.get(old_plain).is_err());
    }

    #[test]
    fn prune_with_nothing_old_deletes_nothing() {
        let store = store();
        let now = epoch_now();
        store.add_turn(&turn(1, 42, "new", now)).unwrap();
        assert_eq!(store.prune(7).unwrap(), 0);
    }
}
