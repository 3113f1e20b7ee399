//! Shared SQLite handle and schema lifecycle.
//!
//! One `Connection` behind a `Mutex` serves every store. Schema setup runs
//! once at open time, before any store issues a write: numbered forward-only
//! migrations tracked in `PRAGMA user_version`, followed by defensive
//! idempotent column-adds for databases created before a column existed.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StoreError};

/// Forward-only migration scripts. Index + 1 is the schema version the
/// script brings the database to. Never edit a shipped entry — append.
const MIGRATIONS: &[&str] = &[
    // v1 — conversation, fact, episode, and prompt storage.
    "CREATE TABLE IF NOT EXISTS messages (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        chat_id             INTEGER NOT NULL,
        thread_id           INTEGER,
        user_id             INTEGER NOT NULL,
        role                TEXT NOT NULL,
        text                TEXT NOT NULL DEFAULT '',
        media               TEXT NOT NULL DEFAULT '[]',
        metadata            TEXT NOT NULL DEFAULT '{}',
        embedding           TEXT,
        created_at          INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conv
        ON messages(chat_id, thread_id, created_at DESC);
    CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts
        USING fts5(text, content='messages', content_rowid='id');

    CREATE TABLE IF NOT EXISTS facts (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_kind         TEXT NOT NULL,
        entity_id           INTEGER NOT NULL,
        chat_context        INTEGER,
        category            TEXT NOT NULL,
        key                 TEXT NOT NULL,
        value               TEXT NOT NULL,
        confidence          REAL NOT NULL,
        evidence_count      INTEGER NOT NULL DEFAULT 1,
        evidence_text       TEXT NOT NULL DEFAULT '',
        source_message_id   INTEGER,
        embedding           TEXT,
        created_at          INTEGER NOT NULL,
        updated_at          INTEGER NOT NULL,
        active              INTEGER NOT NULL DEFAULT 1
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_facts_active_key
        ON facts(entity_kind, entity_id, category, key) WHERE active = 1;
    CREATE INDEX IF NOT EXISTS idx_facts_entity
        ON facts(entity_kind, entity_id);
    CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts
        USING fts5(key, value, content='facts', content_rowid='id');

    CREATE TABLE IF NOT EXISTS fact_versions (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        fact_id             INTEGER NOT NULL,
        change              TEXT NOT NULL,
        confidence_delta    REAL NOT NULL DEFAULT 0,
        prior_value         TEXT,
        new_value           TEXT,
        created_at          INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_fact_versions_fact
        ON fact_versions(fact_id, created_at);

    CREATE TABLE IF NOT EXISTS episodes (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        chat_id             INTEGER NOT NULL,
        thread_id           INTEGER,
        participant_ids     TEXT NOT NULL DEFAULT '[]',
        topic               TEXT NOT NULL,
        summary             TEXT NOT NULL,
        valence             TEXT NOT NULL DEFAULT 'neutral',
        tags                TEXT NOT NULL DEFAULT '[]',
        message_ids         TEXT NOT NULL,
        importance          REAL NOT NULL DEFAULT 0.5,
        embedding           TEXT,
        created_at          INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_episodes_chat
        ON episodes(chat_id, created_at DESC);

    CREATE TABLE IF NOT EXISTS system_prompts (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        scope               TEXT NOT NULL,
        chat_id             INTEGER,
        version             INTEGER NOT NULL,
        body                TEXT NOT NULL,
        active              INTEGER NOT NULL DEFAULT 0,
        created_at          INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_prompts_scope
        ON system_prompts(scope, chat_id, version);",
    // v2 — per-message importance with retention override.
    "CREATE TABLE IF NOT EXISTS message_importance (
        message_id          INTEGER PRIMARY KEY,
        importance          REAL NOT NULL DEFAULT 0.5,
        retention_days      INTEGER
    );",
];

/// Columns added after their table shipped. Re-run every boot; the
/// duplicate-column error from already-migrated databases is swallowed.
const COLUMN_ADDS: &[(&str, &str)] = &[
    ("messages", "external_message_id TEXT"),
    ("messages", "external_user_id TEXT"),
    ("messages", "reply_to_message_id TEXT"),
    ("messages", "reply_to_user_id TEXT"),
    ("facts", "decay_rate REAL NOT NULL DEFAULT 0.0"),
];

/// Shared database handle. All stores clone the `Arc` and serialize access
/// through the inner mutex, which also keeps every write atomic with
/// respect to concurrent readers.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and bring the schema current.
    pub fn open(path: &str) -> Result<Arc<Self>> {
        if let Some(dir) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Arc<Self>> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Arc<Self>> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    /// Lock the connection for one store operation.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            // A panicked store call leaves SQLite itself consistent.
            poisoned.into_inner()
        })
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (idx, script) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        if version <= current {
            continue;
        }
        conn.execute_batch(script)?;
        conn.pragma_update(None, "user_version", version)?;
        info!(version, "applied schema migration");
    }

    for (table, column_def) in COLUMN_ADDS {
        add_column_if_missing(conn, table, column_def)?;
    }
    Ok(())
}

fn add_column_if_missing(conn: &Connection, table: &str, column_def: &str) -> Result<()> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column_def}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(e) if is_duplicate_column(&e) => Ok(()),
        Err(e) => Err(StoreError::Database(e)),
    }
}

fn is_duplicate_column(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("duplicate column")
    )
}

/// Quote a free-form query for FTS5: each word becomes a quoted phrase
/// token, so user punctuation can never be parsed as query syntax.
pub(crate) fn fts_quote(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "")))
        .filter(|quoted| quoted.len() > 2)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a JSON float-array column into an embedding vector.
pub(crate) fn embedding_from_json(raw: Option<String>) -> Option<Vec<f32>> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

/// Serialize an embedding for storage; `None` maps to SQL NULL.
pub(crate) fn embedding_to_json(embedding: Option<&[f32]>) -> Option<String> {
    embedding.and_then(|e| serde_json::to_string(e).ok())
}
