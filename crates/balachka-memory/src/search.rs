//! Hybrid message search: full-text and vector candidates merged under a
//! weighted score with temporal decay and per-message importance.
//!
//! The query embedding is supplied by the caller — this crate never talks
//! to the embedding backend. A missing embedding (short query, throttled
//! backend) degrades the search to keyword-only.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::params;
use tracing::debug;

use balachka_core::config::SearchConfig;
use balachka_core::types::{cosine_similarity, MessageRecord, Role};

use crate::db::{fts_quote, Database};
use crate::error::Result;

/// Queries below this word count skip the semantic leg entirely.
const MIN_SEMANTIC_WORDS: usize = 3;

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    /// Restrict hits to one author when set.
    pub user_id: Option<i64>,
    pub text: String,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct ScoredMessage {
    pub score: f64,
    pub message: MessageRecord,
}

pub struct HybridSearch {
    db: Arc<Database>,
    config: SearchConfig,
}

impl HybridSearch {
    pub fn new(db: Arc<Database>, config: SearchConfig) -> Self {
        Self { db, config }
    }

    /// Top-N messages for a query. `query_embedding` is optional; without
    /// it (or for very short queries) only the keyword leg runs.
    pub fn search(
        &self,
        query: &SearchQuery,
        query_embedding: Option<&[f32]>,
        now: i64,
    ) -> Result<Vec<ScoredMessage>> {
        let semantic_leg = query_embedding.is_some()
            && query.text.split_whitespace().count() >= MIN_SEMANTIC_WORDS;

        let keyword = self.keyword_candidates(query)?;
        let semantic = if semantic_leg {
            self.semantic_candidates(query, query_embedding.unwrap_or(&[]))?
        } else {
            HashMap::new()
        };

        // Union of both candidate sets, message keyed by internal id.
        let mut merged: HashMap<i64, (MessageRecord, f64, f64)> = HashMap::new();
        for (message, kw_score) in keyword {
            merged.insert(message.id, (message, kw_score, 0.0));
        }
        for (message, sem_score) in semantic.into_values() {
            merged
                .entry(message.id)
                .and_modify(|slot| slot.2 = sem_score)
                .or_insert((message, 0.0, sem_score));
        }
        if merged.is_empty() {
            return Ok(Vec::new());
        }

        let importance = self.importance_map(merged.keys().copied().collect::<Vec<_>>())?;

        // Without a semantic leg the keyword score carries the full weight,
        // so keyword-only searches are not globally deflated.
        let (w_s, w_k) = if semantic_leg {
            (self.config.semantic_weight, self.config.keyword_weight)
        } else {
            (0.0, 1.0)
        };

        let mut scored: Vec<ScoredMessage> = merged
            .into_values()
            .map(|(message, kw, sem)| {
                let age_days = (now - message.created_at).max(0) as f64 / 86_400.0;
                let temporal = (-age_days / self.config.half_life_days).exp();
                let importance = importance.get(&message.id).copied().unwrap_or(1.0);
                let score = (sem * w_s + kw * w_k)
                    * temporal.powf(self.config.temporal_weight)
                    * importance
                    * type_boost(&message);
                ScoredMessage {
                    score: score.clamp(0.0, 1.0),
                    message,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.message.created_at.cmp(&a.message.created_at))
                .then(b.message.id.cmp(&a.message.id))
        });
        scored.truncate(query.limit);
        debug!(
            query = %query.text,
            hits = scored.len(),
            semantic_leg,
            "hybrid search complete"
        );
        Ok(scored)
    }

    /// FTS5 matches with bm25 rank min-max-normalized so the best hit
    /// scores 1.0.
    fn keyword_candidates(&self, query: &SearchQuery) -> Result<Vec<(MessageRecord, f64)>> {
        let quoted = fts_quote(&query.text);
        if quoted.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.chat_id, m.thread_id, m.user_id, m.role, m.text,
                    m.media, m.metadata, m.embedding, m.created_at,
                    m.external_message_id, m.external_user_id,
                    m.reply_to_message_id, m.reply_to_user_id, f.rank
             FROM messages m
             JOIN messages_fts f ON m.id = f.rowid
             WHERE messages_fts MATCH ?1
               AND m.chat_id = ?2
               AND (?3 IS NULL OR m.thread_id IS ?3)
               AND (?4 IS NULL OR m.user_id = ?4)
             ORDER BY f.rank
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                quoted,
                query.chat_id,
                query.thread_id,
                query.user_id,
                self.config.max_candidates as i64
            ],
            |row| {
                let rank: f64 = row.get(14)?;
                Ok((crate::conversation::row_to_message(row)?, rank))
            },
        )?;
        let ranked = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(normalize_ranks(ranked))
    }

    /// Cosine similarity against stored message embeddings, newest
    /// `max_candidates` rows only, clamped to [0, 1].
    fn semantic_candidates(
        &self,
        query: &SearchQuery,
        query_embedding: &[f32],
    ) -> Result<HashMap<i64, (MessageRecord, f64)>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, thread_id, user_id, role, text, media,
                    metadata, embedding, created_at, external_message_id,
                    external_user_id, reply_to_message_id, reply_to_user_id
             FROM messages
             WHERE chat_id = ?1
               AND (?2 IS NULL OR thread_id IS ?2)
               AND (?3 IS NULL OR user_id = ?3)
               AND embedding IS NOT NULL
             ORDER BY id DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                query.chat_id,
                query.thread_id,
                query.user_id,
                self.config.max_candidates as i64
            ],
            crate::conversation::row_to_message,
        )?;

        let mut candidates = HashMap::new();
        for message in rows {
            let message = message?;
            let Some(embedding) = message.embedding.as_deref() else {
                continue;
            };
            let sim = cosine_similarity(query_embedding, embedding).clamp(0.0, 1.0);
            if sim > 0.0 {
                candidates.insert(message.id, (message, sim));
            }
        }
        Ok(candidates)
    }

    fn importance_map(&self, ids: Vec<i64>) -> Result<HashMap<i64, f64>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.db.lock();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT message_id, importance FROM message_importance
             WHERE message_id IN ({placeholders})"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }
}

/// The bot's own replies rank slightly below user messages at equal
/// relevance.
fn type_boost(message: &MessageRecord) -> f64 {
    match message.role {
        Role::User => 1.0,
        Role::Model => 0.9,
    }
}

/// Min-max normalize bm25 ranks (lower is better) into [0, 1] with the
/// best candidate at 1.0.
fn normalize_ranks(ranked: Vec<(MessageRecord, f64)>) -> Vec<(MessageRecord, f64)> {
    let Some((min, max)) = ranked
        .iter()
        .map(|(_, r)| *r)
        .fold(None, |acc: Option<(f64, f64)>, r| match acc {
            None => Some((r, r)),
            Some((lo, hi)) => Some((lo.min(r), hi.max(r))),
        })
    else {
        return Vec::new();
    };
    let span = max - min;
    ranked
        .into_iter()
        .map(|(message, rank)| {
            let score = if span.abs() < f64::EPSILON {
                1.0
            } else {
                (max - rank) / span
            };
            (message, score)
        })
        .collect()
}
