//! Multi-level context assembler: five layers fetched in parallel,
//! truncated to per-layer sub-budgets, with leftover budget redistributed
//! greedily to the relevant and recent layers.
//!
//! A failing layer contributes nothing — no layer error ever propagates
//! to the caller. The only hard failure is a budget too small for even
//! the immediate layer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task;
use tracing::{debug, warn};

use balachka_core::config::ContextConfig;
use balachka_core::types::{epoch_now, Entity, Fact, MessageRecord};
use balachka_memory::conversation::ConversationStore;
use balachka_memory::episodes::EpisodeStore;
use balachka_memory::facts::FactStore;
use balachka_memory::search::{HybridSearch, SearchQuery};

use crate::embedding::Embedder;
use crate::pipeline::tokens::{estimate_message, estimate_messages, estimate_text};
use crate::pipeline::ContextError;
use crate::telemetry::Telemetry;

/// Turn pairs fetched for the immediate layer; the layer keeps at most 5
/// messages of the result.
const IMMEDIATE_TURNS: usize = 3;
const IMMEDIATE_MAX_MESSAGES: usize = 5;
/// Turn pairs fetched for the recent layer before exclusion/truncation.
const RECENT_TURNS: usize = 15;
/// Search hits requested for the relevant layer before deduplication.
const RELEVANT_HITS: usize = 10;
/// Facts per entity offered to the background layer.
const BACKGROUND_FACTS: usize = 10;
/// Episodes offered to the episodic layer.
const EPISODIC_HITS: usize = 3;

#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub user_id: i64,
    pub query_text: String,
    pub token_budget: usize,
}

#[derive(Debug, Clone)]
pub struct LayerStats {
    pub name: &'static str,
    pub sub_budget: usize,
    pub tokens: usize,
    pub items: usize,
}

/// The assembled bundle, pre-format: message layers stay as records so
/// either output format can render them.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub immediate: Vec<MessageRecord>,
    pub recent: Vec<MessageRecord>,
    pub relevant: Vec<MessageRecord>,
    pub background: String,
    pub episodic: String,
    pub stats: Vec<LayerStats>,
}

impl ContextBundle {
    pub fn total_tokens(&self) -> usize {
        estimate_messages(&self.immediate)
            + estimate_messages(&self.recent)
            + estimate_messages(&self.relevant)
            + estimate_text(&self.background)
            + estimate_text(&self.episodic)
    }

    /// Immediate and recent merged back into one chronological window.
    pub fn conversation(&self) -> Vec<MessageRecord> {
        let mut all: Vec<MessageRecord> = self
            .recent
            .iter()
            .chain(self.immediate.iter())
            .cloned()
            .collect();
        all.sort_by_key(|m| (m.created_at, m.id));
        all
    }
}

pub struct ContextAssembler {
    conversations: Arc<ConversationStore>,
    search: Arc<HybridSearch>,
    facts: Arc<FactStore>,
    episodes: Arc<EpisodeStore>,
    embedder: Arc<Embedder>,
    config: ContextConfig,
    /// Word-set Jaccard similarity above which two snippets are duplicates.
    dedup_threshold: f64,
    telemetry: Arc<Telemetry>,
}

impl ContextAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: Arc<ConversationStore>,
        search: Arc<HybridSearch>,
        facts: Arc<FactStore>,
        episodes: Arc<EpisodeStore>,
        embedder: Arc<Embedder>,
        config: ContextConfig,
        dedup_threshold: f64,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            conversations,
            search,
            facts,
            episodes,
            embedder,
            config,
            dedup_threshold,
            telemetry,
        }
    }

    pub async fn assemble(&self, req: &ContextRequest) -> Result<ContextBundle, ContextError> {
        let budget = req.token_budget;
        let immediate_budget = scale(budget, self.config.immediate_ratio);
        let recent_budget = scale(budget, self.config.recent_ratio);
        let relevant_budget = scale(budget, self.config.relevant_ratio);
        let background_budget = scale(budget, self.config.background_ratio);
        let episodic_budget = scale(budget, self.config.episodic_ratio);

        let query_embedding = self.query_embedding(&req.query_text).await;

        // All layers fetch in parallel; each failure degrades to empty.
        let (immediate_raw, recent_raw, relevant_raw, background_raw, episodic_raw) = tokio::join!(
            self.fetch_immediate(req),
            self.fetch_recent(req),
            self.fetch_relevant(req, query_embedding.clone()),
            self.fetch_background(req, background_budget),
            self.fetch_episodic(req, query_embedding),
        );

        let immediate_raw = self.unwrap_layer("immediate", immediate_raw);
        let mut recent_raw = self.unwrap_layer("recent", recent_raw);
        let mut relevant_raw = self.unwrap_layer("relevant", relevant_raw);
        let background_raw = self.unwrap_layer("background", background_raw);
        let episodic_raw = self.unwrap_layer("episodic", episodic_raw);

        // Recent never repeats immediate; relevant never repeats either.
        let immediate_ids: HashSet<i64> = immediate_raw.iter().map(|m| m.id).collect();
        recent_raw.retain(|m| !immediate_ids.contains(&m.id));
        let seen: HashSet<i64> = immediate_ids
            .iter()
            .copied()
            .chain(recent_raw.iter().map(|m| m.id))
            .collect();
        relevant_raw.retain(|m| !seen.contains(&m.id));

        // Pass 1: per-layer truncation.
        let had_immediate = !immediate_raw.is_empty();
        let (immediate, _) = truncate_newest(immediate_raw, immediate_budget);
        if had_immediate && immediate.is_empty() {
            return Err(ContextError::BudgetExceeded);
        }
        let (mut recent, recent_dropped) = truncate_newest(recent_raw, recent_budget);
        let (mut relevant, relevant_dropped) = truncate_ranked(relevant_raw, relevant_budget);
        let background = truncate_text(background_raw, background_budget);
        let episodic = truncate_text(episodic_raw, episodic_budget);

        // Pass 2: hand unused budget to relevant, then recent.
        let mut leftover = (immediate_budget - estimate_messages(&immediate))
            + (recent_budget - estimate_messages(&recent))
            + (relevant_budget - estimate_messages(&relevant))
            + (background_budget.saturating_sub(estimate_text(&background)))
            + (episodic_budget.saturating_sub(estimate_text(&episodic)));

        for message in relevant_dropped {
            let cost = estimate_message(&message);
            if cost <= leftover {
                leftover -= cost;
                relevant.push(message);
            }
        }
        for message in recent_dropped {
            let cost = estimate_message(&message);
            if cost <= leftover {
                leftover -= cost;
                recent.push(message);
            }
        }
        recent.sort_by_key(|m| (m.created_at, m.id));

        let stats = vec![
            layer_stats("immediate", immediate_budget, estimate_messages(&immediate), immediate.len()),
            layer_stats("recent", recent_budget, estimate_messages(&recent), recent.len()),
            layer_stats("relevant", relevant_budget, estimate_messages(&relevant), relevant.len()),
            layer_stats("background", background_budget, estimate_text(&background), usize::from(!background.is_empty())),
            layer_stats("episodic", episodic_budget, estimate_text(&episodic), usize::from(!episodic.is_empty())),
        ];

        let bundle = ContextBundle {
            immediate,
            recent,
            relevant,
            background,
            episodic,
            stats,
        };
        debug!(
            chat_id = req.chat_id,
            total_tokens = bundle.total_tokens(),
            budget,
            "context assembled"
        );
        Ok(bundle)
    }

    /// Embed the query, bounded by the assembly deadline. Failure or
    /// timeout degrades every semantic consumer to keyword/recency mode.
    async fn query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        if query.split_whitespace().count() < 3 {
            return None;
        }
        let deadline = Duration::from_millis(self.config.assembly_timeout_ms);
        match tokio::time::timeout(deadline, self.embedder.embed_one(query)).await {
            Ok(Ok(embedding)) => Some(embedding),
            Ok(Err(e)) => {
                warn!(error = %e, "query embedding failed, degrading to keyword-only");
                Telemetry::incr(&self.telemetry.search_degraded_keyword_only);
                None
            }
            Err(_) => {
                warn!("query embedding timed out, degrading to keyword-only");
                Telemetry::incr(&self.telemetry.search_degraded_keyword_only);
                None
            }
        }
    }

    async fn fetch_immediate(&self, req: &ContextRequest) -> LayerResult<Vec<MessageRecord>> {
        let store = Arc::clone(&self.conversations);
        let (chat_id, thread_id) = (req.chat_id, req.thread_id);
        run_blocking(move || {
            let mut messages = store.recent(chat_id, thread_id, IMMEDIATE_TURNS)?;
            if messages.len() > IMMEDIATE_MAX_MESSAGES {
                messages.drain(..messages.len() - IMMEDIATE_MAX_MESSAGES);
            }
            Ok(messages)
        })
        .await
    }

    async fn fetch_recent(&self, req: &ContextRequest) -> LayerResult<Vec<MessageRecord>> {
        let store = Arc::clone(&self.conversations);
        let (chat_id, thread_id) = (req.chat_id, req.thread_id);
        run_blocking(move || Ok(store.recent(chat_id, thread_id, RECENT_TURNS)?)).await
    }

    async fn fetch_relevant(
        &self,
        req: &ContextRequest,
        query_embedding: Option<Vec<f32>>,
    ) -> LayerResult<Vec<MessageRecord>> {
        if !self.config.relevant_enabled || req.query_text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let search = Arc::clone(&self.search);
        let threshold = self.dedup_threshold;
        let query = SearchQuery {
            chat_id: req.chat_id,
            thread_id: req.thread_id,
            user_id: None,
            text: req.query_text.clone(),
            limit: RELEVANT_HITS,
        };
        run_blocking(move || {
            let hits = search.search(&query, query_embedding.as_deref(), epoch_now())?;
            Ok(dedup_snippets(
                hits.into_iter().map(|h| h.message).collect(),
                threshold,
            ))
        })
        .await
    }

    /// User profile plus chat facts. With chat memory on, the layer's
    /// sub-budget splits 60% user / 40% chat.
    async fn fetch_background(&self, req: &ContextRequest, budget: usize) -> LayerResult<String> {
        if !self.config.background_enabled {
            return Ok(String::new());
        }
        let facts = Arc::clone(&self.facts);
        let user = Entity::User(req.user_id);
        let chat = Entity::Chat(req.chat_id);
        let chat_memory = self.config.chat_memory_enabled;
        run_blocking(move || {
            let user_facts = facts.get_facts(user, None, None, Some(BACKGROUND_FACTS))?;
            let (user_budget, chat_facts) = if chat_memory {
                (
                    scale(budget, 0.6),
                    facts.get_facts(chat, None, None, Some(BACKGROUND_FACTS))?,
                )
            } else {
                (budget, Vec::new())
            };
            let chat_budget = budget - user_budget;
            Ok(render_background(
                &user_facts,
                user_budget,
                &chat_facts,
                chat_budget,
            ))
        })
        .await
    }

    async fn fetch_episodic(
        &self,
        req: &ContextRequest,
        query_embedding: Option<Vec<f32>>,
    ) -> LayerResult<String> {
        if !self.config.episodic_enabled {
            return Ok(String::new());
        }
        let episodes = Arc::clone(&self.episodes);
        let chat_id = req.chat_id;
        run_blocking(move || {
            let top = match query_embedding {
                Some(embedding) => episodes
                    .semantic(chat_id, &embedding, EPISODIC_HITS)?
                    .into_iter()
                    .map(|(_, ep)| ep)
                    .collect(),
                None => episodes.by_chat(chat_id, None, EPISODIC_HITS)?,
            };
            let mut out = String::new();
            for episode in top {
                out.push_str(&format!(
                    "«{}» ({}): {}\n",
                    episode.topic, episode.valence, episode.summary
                ));
            }
            Ok(out)
        })
        .await
    }

    fn unwrap_layer<T: Default>(&self, name: &'static str, result: LayerResult<T>) -> T {
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(layer = name, error = %e, "context layer failed, contributing nothing");
                Telemetry::incr(&self.telemetry.context_layer_failures);
                T::default()
            }
        }
    }
}

type LayerResult<T> = Result<T, ContextError>;

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> LayerResult<T> + Send + 'static,
) -> LayerResult<T> {
    task::spawn_blocking(f)
        .await
        .map_err(|_| ContextError::Cancelled)?
}

fn scale(budget: usize, ratio: f64) -> usize {
    (budget as f64 * ratio) as usize
}

fn layer_stats(name: &'static str, sub_budget: usize, tokens: usize, items: usize) -> LayerStats {
    LayerStats {
        name,
        sub_budget,
        tokens,
        items,
    }
}

/// Keep the newest messages that fit the budget; return survivors in
/// chronological order and the dropped remainder (newest first).
fn truncate_newest(
    messages: Vec<MessageRecord>,
    budget: usize,
) -> (Vec<MessageRecord>, Vec<MessageRecord>) {
    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    let mut used = 0;
    for message in messages.into_iter().rev() {
        let cost = estimate_message(&message);
        if used + cost <= budget {
            used += cost;
            kept.push(message);
        } else {
            dropped.push(message);
        }
    }
    kept.reverse();
    (kept, dropped)
}

/// Keep the highest-ranked snippets that fit (input is already in rank
/// order); the dropped remainder keeps its rank order too.
fn truncate_ranked(
    messages: Vec<MessageRecord>,
    budget: usize,
) -> (Vec<MessageRecord>, Vec<MessageRecord>) {
    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    let mut used = 0;
    for message in messages {
        let cost = estimate_message(&message);
        if used + cost <= budget {
            used += cost;
            kept.push(message);
        } else {
            dropped.push(message);
        }
    }
    (kept, dropped)
}

fn truncate_text(text: String, budget: usize) -> String {
    if estimate_text(&text) <= budget {
        return text;
    }
    text.chars().take(budget * 4).collect()
}

/// Remove near-duplicate snippets by word-set Jaccard similarity, keeping
/// the first (highest-ranked) instance.
fn dedup_snippets(messages: Vec<MessageRecord>, threshold: f64) -> Vec<MessageRecord> {
    let mut kept: Vec<MessageRecord> = Vec::new();
    for message in messages {
        let duplicate = kept
            .iter()
            .any(|k| jaccard(&k.text, &message.text) >= threshold);
        if !duplicate {
            kept.push(message);
        }
    }
    kept
}

fn jaccard(a: &str, b: &str) -> f64 {
    let words_a: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let words_b: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();
    if words_a.is_empty() && words_b.is_empty() {
        return 1.0;
    }
    let intersection = words_a.intersection(&words_b).count() as f64;
    let union = words_a.union(&words_b).count() as f64;
    intersection / union
}

fn render_background(
    user_facts: &[Fact],
    user_budget: usize,
    chat_facts: &[Fact],
    chat_budget: usize,
) -> String {
    let mut out = String::new();
    out.push_str(&render_fact_section(
        "Known about this user:",
        user_facts,
        user_budget,
    ));
    out.push_str(&render_fact_section(
        "Known about this chat:",
        chat_facts,
        chat_budget,
    ));
    out
}

/// Highest-confidence facts first, stopping at the section budget.
fn render_fact_section(header: &str, facts: &[Fact], budget: usize) -> String {
    if facts.is_empty() || budget == 0 {
        return String::new();
    }
    let mut out = format!("{header}\n");
    for fact in facts {
        let line = format!("- [{}] {}: {}\n", fact.category, fact.key, fact.value);
        if estimate_text(&out) + estimate_text(&line) > budget {
            break;
        }
        out.push_str(&line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use balachka_core::config::SearchConfig;
    use balachka_core::types::{ExternalIds, Role};
    use balachka_memory::conversation::NewTurn;
    use balachka_memory::db::Database;
    use std::collections::BTreeMap;

    use crate::provider::{GenerateRequest, GenerateResponse, LlmClient, LlmError};
    use async_trait::async_trait;

    struct StubLlm;

    #[async_trait]
    impl LlmClient for StubLlm {
        fn name(&self) -> &str {
            "stub"
        }
        async fn generate(&self, _req: &GenerateRequest) -> Result<GenerateResponse, LlmError> {
            unreachable!("assembler never generates")
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        fn embedding_dim(&self) -> usize {
            2
        }
    }

    fn assembler(db: Arc<Database>, config: ContextConfig) -> ContextAssembler {
        ContextAssembler::new(
            Arc::new(ConversationStore::new(Arc::clone(&db))),
            Arc::new(HybridSearch::new(Arc::clone(&db), SearchConfig::default())),
            Arc::new(FactStore::new(Arc::clone(&db), 0.85)),
            Arc::new(EpisodeStore::new(db)),
            Arc::new(Embedder::new(Arc::new(StubLlm))),
            config,
            0.85,
            Arc::new(Telemetry::default()),
        )
    }

    fn seed_messages(db: &Arc<Database>, count: usize, words: usize) {
        let store = ConversationStore::new(Arc::clone(db));
        let filler = "слово ".repeat(words);
        for i in 0..count {
            store
                .add_turn(&NewTurn {
                    chat_id: 1,
                    thread_id: None,
                    user_id: 42,
                    role: Role::User,
                    text: format!("message {i} {filler}"),
                    media: Vec::new(),
                    metadata: BTreeMap::new(),
                    external: ExternalIds::default(),
                    embedding: None,
                    created_at: 1_000 + i as i64,
                })
                .unwrap();
        }
    }

    fn request(budget: usize) -> ContextRequest {
        ContextRequest {
            chat_id: 1,
            thread_id: None,
            user_id: 42,
            query_text: "what was that long discussion about".to_string(),
            token_budget: budget,
        }
    }

    #[tokio::test]
    async fn budget_is_honoured_with_many_long_messages() {
        let db = Database::open_in_memory().unwrap();
        seed_messages(&db, 100, 120);
        let assembler = assembler(Arc::clone(&db), ContextConfig::default());

        let budget = 1_000;
        let bundle = assembler.assemble(&request(budget)).await.unwrap();

        assert!(
            bundle.total_tokens() <= budget + budget / 10,
            "total {} over budget {}",
            bundle.total_tokens(),
            budget
        );
        for stats in &bundle.stats {
            assert!(
                stats.tokens <= stats.sub_budget + stats.sub_budget / 10,
                "layer {} used {} of {}",
                stats.name,
                stats.tokens,
                stats.sub_budget
            );
        }
        assert!(!bundle.immediate.is_empty());
    }

    #[tokio::test]
    async fn impossible_budget_is_budget_exceeded() {
        let db = Database::open_in_memory().unwrap();
        seed_messages(&db, 5, 400);
        let assembler = assembler(Arc::clone(&db), ContextConfig::default());

        let result = assembler.assemble(&request(40)).await;
        assert!(matches!(result, Err(ContextError::BudgetExceeded)));
    }

    #[tokio::test]
    async fn empty_chat_assembles_empty_bundle() {
        let db = Database::open_in_memory().unwrap();
        let assembler = assembler(db, ContextConfig::default());
        let bundle = assembler.assemble(&request(1_000)).await.unwrap();
        assert!(bundle.immediate.is_empty());
        assert_eq!(bundle.total_tokens(), 0);
    }

    #[tokio::test]
    async fn recent_excludes_immediate_messages() {
        let db = Database::open_in_memory().unwrap();
        seed_messages(&db, 20, 3);
        let assembler = assembler(db, ContextConfig::default());
        let bundle = assembler.assemble(&request(8_000)).await.unwrap();

        let immediate: HashSet<i64> = bundle.immediate.iter().map(|m| m.id).collect();
        assert!(!immediate.is_empty());
        assert!(bundle.recent.iter().all(|m| !immediate.contains(&m.id)));
    }

    #[tokio::test]
    async fn disabled_layers_contribute_nothing() {
        let db = Database::open_in_memory().unwrap();
        seed_messages(&db, 10, 3);
        let config = ContextConfig {
            relevant_enabled: false,
            background_enabled: false,
            episodic_enabled: false,
            ..ContextConfig::default()
        };
        let assembler = assembler(db, config);
        let bundle = assembler.assemble(&request(8_000)).await.unwrap();
        assert!(bundle.relevant.is_empty());
        assert!(bundle.background.is_empty());
        assert!(bundle.episodic.is_empty());
    }

    #[test]
    fn jaccard_catches_near_duplicates() {
        assert!(jaccard("the quick brown fox", "the quick brown fox") >= 0.99);
        assert!(jaccard("the quick brown fox jumps high", "the quick brown fox jumps") > 0.8);
        assert!(jaccard("totally different words", "nothing in common here") < 0.1);
    }

    #[test]
    fn dedup_keeps_highest_ranked_instance() {
        let mk = |id: i64, text: &str| MessageRecord {
            id,
            chat_id: 1,
            thread_id: None,
            user_id: 42,
            role: Role::User,
            text: text.to_string(),
            media: Vec::new(),
            metadata: BTreeMap::new(),
            embedding: None,
            created_at: 0,
            external: ExternalIds::default(),
        };
        let out = dedup_snippets(
            vec![
                mk(1, "going hiking on saturday morning"),
                mk(2, "going hiking on saturday morning"),
                mk(3, "compiler error in the parser"),
            ],
            0.85,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, 1);
    }
}
