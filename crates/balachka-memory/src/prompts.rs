//! System prompt manager: versioned prompt records with at most one active
//! row per scope, composed with learned persona rules and cached per chat.
//!
//! Cache expiry is lazy — entries older than the TTL are rebuilt on the
//! next read. `set_prompt` and `activate_version` invalidate only the
//! affected scope (all chats for global).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use balachka_core::types::{epoch_now, Entity, FactCategory};

use crate::db::Database;
use crate::error::{Result, StoreError};
use crate::facts::FactStore;

/// Composed prompts are served from cache for one hour.
const CACHE_TTL_SECS: i64 = 3_600;
/// Learned persona rules injected per prompt, highest confidence first.
const MAX_PERSONA_RULES: usize = 10;

/// Prompt scope: one global default plus optional per-chat overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptScope {
    Global,
    Chat(i64),
}

impl PromptScope {
    fn kind(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Chat(_) => "chat",
        }
    }

    fn chat_id(&self) -> Option<i64> {
        match self {
            Self::Global => None,
            Self::Chat(id) => Some(*id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptRecord {
    pub id: i64,
    pub scope: PromptScope,
    pub version: i64,
    pub body: String,
    pub active: bool,
    pub created_at: i64,
}

#[derive(Clone)]
struct CachedPrompt {
    composed: String,
    built_at: i64,
}

pub struct SystemPromptManager {
    db: Arc<Database>,
    facts: Arc<FactStore>,
    /// Fallback persona when no global record is active.
    base_prompt: String,
    /// Entity whose Rule facts become learned persona rules.
    bot_user_id: i64,
    cache: Mutex<HashMap<Option<i64>, CachedPrompt>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SystemPromptManager {
    pub fn new(
        db: Arc<Database>,
        facts: Arc<FactStore>,
        base_prompt: String,
        bot_user_id: i64,
    ) -> Self {
        Self {
            db,
            facts,
            base_prompt,
            bot_user_id,
            cache: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The composed system prompt for a chat: base persona (global record
    /// when active, config default otherwise) → chat override → learned
    /// persona rules. Cached per chat for [`CACHE_TTL_SECS`].
    pub fn get_active_prompt(&self, chat_id: Option<i64>) -> Result<String> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&chat_id) {
                if epoch_now() - entry.built_at < CACHE_TTL_SECS {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.composed.clone());
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let composed = self.compose(chat_id)?;
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            chat_id,
            CachedPrompt {
                composed: composed.clone(),
                built_at: epoch_now(),
            },
        );
        Ok(composed)
    }

    fn compose(&self, chat_id: Option<i64>) -> Result<String> {
        let mut out = match self.active_record(PromptScope::Global)? {
            Some(record) => record.body,
            None => self.base_prompt.clone(),
        };

        if let Some(chat_id) = chat_id {
            if let Some(record) = self.active_record(PromptScope::Chat(chat_id))? {
                out.push_str("\n\n");
                out.push_str(&record.body);
            }
        }

        let rules = self.facts.get_facts(
            Entity::User(self.bot_user_id),
            Some(FactCategory::Rule),
            None,
            Some(MAX_PERSONA_RULES),
        )?;
        if !rules.is_empty() {
            out.push_str("\n\nLearned rules:\n");
            for rule in rules {
                out.push_str(&format!("- {}\n", rule.value));
            }
        }
        debug!(?chat_id, "system prompt composed");
        Ok(out)
    }

    /// Store a new version for a scope and make it active. Returns the
    /// version number.
    pub fn set_prompt(&self, scope: PromptScope, body: &str) -> Result<i64> {
        let version = {
            let conn = self.db.lock();
            let next: i64 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM system_prompts
                 WHERE scope = ?1 AND chat_id IS ?2",
                params![scope.kind(), scope.chat_id()],
                |row| row.get(0),
            )?;
            conn.execute(
                "UPDATE system_prompts SET active = 0
                 WHERE scope = ?1 AND chat_id IS ?2",
                params![scope.kind(), scope.chat_id()],
            )?;
            conn.execute(
                "INSERT INTO system_prompts (scope, chat_id, version, body, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![scope.kind(), scope.chat_id(), next, body, epoch_now()],
            )?;
            next
        };
        self.invalidate(scope);
        info!(scope = scope.kind(), version, "system prompt updated");
        Ok(version)
    }

    /// Re-activate an earlier version; the currently active one is
    /// deactivated in the same call.
    pub fn activate_version(&self, scope: PromptScope, version: i64) -> Result<()> {
        {
            let conn = self.db.lock();
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM system_prompts
                     WHERE scope = ?1 AND chat_id IS ?2 AND version = ?3",
                    params![scope.kind(), scope.chat_id(), version],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = exists else {
                return Err(StoreError::NotFound {
                    what: format!("prompt version {version} for scope {}", scope.kind()),
                });
            };
            conn.execute(
                "UPDATE system_prompts SET active = 0
                 WHERE scope = ?1 AND chat_id IS ?2",
                params![scope.kind(), scope.chat_id()],
            )?;
            conn.execute("UPDATE system_prompts SET active = 1 WHERE id = ?1", [id])?;
        }
        self.invalidate(scope);
        Ok(())
    }

    /// Version history for a scope, newest first.
    pub fn history(&self, scope: PromptScope, limit: usize) -> Result<Vec<PromptRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, scope, chat_id, version, body, active, created_at
             FROM system_prompts
             WHERE scope = ?1 AND chat_id IS ?2
             ORDER BY version DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![scope.kind(), scope.chat_id(), limit as i64],
            row_to_record,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn active_record(&self, scope: PromptScope) -> Result<Option<PromptRecord>> {
        let conn = self.db.lock();
        let record = conn
            .query_row(
                "SELECT id, scope, chat_id, version, body, active, created_at
                 FROM system_prompts
                 WHERE scope = ?1 AND chat_id IS ?2 AND active = 1",
                params![scope.kind(), scope.chat_id()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Drop the affected cache entries: one chat for a chat scope, the
    /// whole cache for global (every composed prompt embeds the base).
    fn invalidate(&self, scope: PromptScope) {
        let mut cache = self.cache.lock().unwrap();
        match scope {
            PromptScope::Global => cache.clear(),
            PromptScope::Chat(chat_id) => {
                cache.remove(&Some(chat_id));
            }
        }
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptRecord> {
    let kind: String = row.get(1)?;
    let chat_id: Option<i64> = row.get(2)?;
    let scope = match (kind.as_str(), chat_id) {
        ("chat", Some(id)) => PromptScope::Chat(id),
        _ => PromptScope::Global,
    };
    Ok(PromptRecord {
        id: row.get(0)?,
        scope,
        version: row.get(3)?,
        body: row.get(4)?,
        active: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}
