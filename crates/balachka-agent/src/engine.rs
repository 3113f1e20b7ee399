//! Runtime wiring: ingest pipeline, background loops, graceful shutdown.
//!
//! Per-conversation ordering holds at two points: ingestion is serialized
//! by a per-(chat, thread) lock, and closed-window processing acquires a
//! per-conversation extraction lock *before* its task is spawned, so a
//! later window can never overtake an earlier one still extracting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use balachka_core::config::{BalachkaConfig, OutputFormat};
use balachka_core::error::ConfigError;
use balachka_core::types::{epoch_now, Entity, IncomingMessage, Role};
use balachka_memory::conversation::{ConversationStore, NewTurn};
use balachka_memory::db::Database;
use balachka_memory::episodes::{EpisodeStore, NewEpisode};
use balachka_memory::error::StoreError;
use balachka_memory::facts::FactStore;
use balachka_memory::prompts::SystemPromptManager;
use balachka_memory::search::HybridSearch;

use crate::capability;
use crate::embedding::Embedder;
use crate::episodes::monitor::{episode_importance, ClosedWindow, EpisodeMonitor};
use crate::episodes::summarizer::EpisodeSummarizer;
use crate::facts::extractor::FactExtractor;
use crate::facts::quality::QualityPipeline;
use crate::pipeline::context::{ContextAssembler, ContextRequest};
use crate::pipeline::format;
use crate::pipeline::ContextError;
use crate::provider::{GenerateRequest, GenerateResponse, LlmClient, LlmError, Part, Turn};
use crate::telemetry::Telemetry;
use crate::tools::dispatcher::ToolDispatcher;
use crate::tools::{memory_toolset, ToolInvocation};

/// Rounds of tool execution per user turn before the loop is cut.
const MAX_TOOL_ROUNDS: usize = 4;
/// Messages embedded per backfill tick.
const BACKFILL_BATCH: usize = 32;
/// Backfill loop cadence.
const BACKFILL_INTERVAL: Duration = Duration::from_secs(60);
/// Shutdown grace for background work.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

type ConvKey = (i64, Option<i64>);

/// Everything closed-window processing needs, shared between the ingest
/// path, the sweep loop, and shutdown draining.
struct WindowProcessor {
    episodes: Arc<EpisodeStore>,
    summarizer: EpisodeSummarizer,
    extractor: FactExtractor,
    quality: QualityPipeline,
    embedder: Arc<Embedder>,
    telemetry: Arc<Telemetry>,
    min_messages: usize,
    bot_user_id: i64,
}

impl WindowProcessor {
    /// Summarize, persist the episode, then extract facts per non-bot
    /// participant. Never fails — every step degrades and logs.
    async fn process(&self, closed: ClosedWindow) {
        let window = &closed.window;
        Telemetry::incr(&self.telemetry.windows_closed);
        if window.messages.len() < self.min_messages {
            debug!(
                chat_id = window.chat_id,
                messages = window.messages.len(),
                "window below episode minimum, discarded"
            );
            return;
        }

        let summary = self.summarizer.summarize(window, closed.reason).await;
        let embedding = match self
            .embedder
            .embed_one(&format!("{}\n{}", summary.topic, summary.summary))
            .await
        {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                warn!(error = %e, "episode embedding failed, storing without");
                None
            }
        };

        let mut participants: Vec<i64> = window.participants.iter().copied().collect();
        participants.sort_unstable();
        let mut message_ids: Vec<i64> = window.messages.iter().map(|m| m.id).collect();
        message_ids.sort_unstable();
        message_ids.dedup();

        let episode = NewEpisode {
            chat_id: window.chat_id,
            thread_id: window.thread_id,
            participant_ids: participants.clone(),
            topic: summary.topic,
            summary: summary.summary,
            valence: summary.valence,
            tags: summary.tags,
            message_ids,
            importance: episode_importance(
                window.messages.len(),
                window.participants.len(),
                window.duration_seconds(),
            ),
            embedding,
            created_at: epoch_now(),
        };
        match self.episodes.insert(&episode) {
            Ok(id) => {
                Telemetry::incr(&self.telemetry.episodes_created);
                info!(episode_id = id, chat_id = window.chat_id, "episode persisted");
            }
            Err(e) => error!(error = %e, "episode persist failed"),
        }

        let observed_at = window.last_activity;
        for user_id in participants {
            if user_id == self.bot_user_id {
                continue;
            }
            let candidates = self.extractor.extract(window, user_id).await;
            if candidates.is_empty() {
                continue;
            }
            self.quality
                .process(
                    Entity::User(user_id),
                    Some(window.chat_id),
                    window.messages.iter().map(|m| m.id).max(),
                    candidates,
                    observed_at,
                )
                .await;
        }
    }
}

pub struct Engine {
    config: BalachkaConfig,
    conversations: Arc<ConversationStore>,
    facts: Arc<FactStore>,
    prompts: Arc<SystemPromptManager>,
    assembler: ContextAssembler,
    monitor: Arc<EpisodeMonitor>,
    processor: Arc<WindowProcessor>,
    dispatcher: Arc<ToolDispatcher>,
    embedder: Arc<Embedder>,
    llm: Arc<dyn LlmClient>,
    llm_permits: Arc<Semaphore>,
    telemetry: Arc<Telemetry>,
    ingest_locks: DashMap<ConvKey, Arc<AsyncMutex<()>>>,
    extraction_locks: DashMap<ConvKey, Arc<AsyncMutex<()>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open the configured database and build the engine.
    pub fn new(config: BalachkaConfig, llm: Arc<dyn LlmClient>) -> Result<Arc<Self>, EngineError> {
        let db = Database::open(&config.database.path)?;
        Self::with_database(config, db, llm)
    }

    /// Build against an existing database handle (tests, embedded use).
    pub fn with_database(
        config: BalachkaConfig,
        db: Arc<Database>,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Arc<Self>, EngineError> {
        config.validate()?;

        let conversations = Arc::new(ConversationStore::new(Arc::clone(&db)));
        // Fatal startup check: never mix embedding spaces in one store.
        if let Some(store_dim) = conversations.any_embedding_dim()? {
            if store_dim != llm.embedding_dim() {
                return Err(ConfigError::EmbeddingDim {
                    model_dim: llm.embedding_dim(),
                    store_dim,
                }
                .into());
            }
        }

        let facts = Arc::new(FactStore::new(
            Arc::clone(&db),
            config.facts.duplicate_threshold,
        ));
        let episodes = Arc::new(EpisodeStore::new(Arc::clone(&db)));
        let search = Arc::new(HybridSearch::new(Arc::clone(&db), config.search.clone()));
        let prompts = Arc::new(SystemPromptManager::new(
            Arc::clone(&db),
            Arc::clone(&facts),
            config.persona.base_prompt.clone(),
            config.persona.bot_user_id,
        ));
        let embedder = Arc::new(Embedder::new(Arc::clone(&llm)));
        let telemetry = Arc::new(Telemetry::default());

        let assembler = ContextAssembler::new(
            Arc::clone(&conversations),
            search,
            Arc::clone(&facts),
            Arc::clone(&episodes),
            Arc::clone(&embedder),
            config.context.clone(),
            config.search.deduplication_similarity_threshold,
            Arc::clone(&telemetry),
        );
        let processor = Arc::new(WindowProcessor {
            episodes,
            summarizer: EpisodeSummarizer::new(Arc::clone(&llm), config.llm.model.clone()),
            extractor: FactExtractor::new(
                Arc::clone(&llm),
                config.llm.model.clone(),
                config.facts.extraction_method,
                config.facts.min_confidence,
            ),
            quality: QualityPipeline::new(
                Arc::clone(&facts),
                Arc::clone(&embedder),
                config.facts.duplicate_threshold,
                Arc::clone(&telemetry),
            ),
            embedder: Arc::clone(&embedder),
            telemetry: Arc::clone(&telemetry),
            min_messages: config.episodes.min_messages,
            bot_user_id: config.persona.bot_user_id,
        });
        let dispatcher = Arc::new(ToolDispatcher::new(
            memory_toolset(Arc::clone(&facts)),
            config.llm.tool_result_token_budget,
            Arc::clone(&telemetry),
        ));
        let monitor = Arc::new(EpisodeMonitor::new(config.episodes.clone()));
        let llm_permits = Arc::new(Semaphore::new(config.llm.max_concurrent_calls.max(1)));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            conversations,
            facts,
            prompts,
            assembler,
            monitor,
            processor,
            dispatcher,
            embedder,
            llm,
            llm_permits,
            telemetry,
            ingest_locks: DashMap::new(),
            extraction_locks: DashMap::new(),
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn facts(&self) -> &Arc<FactStore> {
        &self.facts
    }

    pub fn prompts(&self) -> &Arc<SystemPromptManager> {
        &self.prompts
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    /// Ingest one message; returns the reply text when the message was
    /// addressed to the bot. Background failures never surface here —
    /// only ingest-persist errors do.
    pub async fn handle_message(
        self: &Arc<Self>,
        incoming: IncomingMessage,
    ) -> Result<Option<String>, EngineError> {
        let key = (incoming.chat_id, incoming.thread_id);
        let message_id = {
            let lock = self.conv_lock(&self.ingest_locks, key);
            let _guard = lock.lock().await;

            let message_id = self.conversations.add_turn(&ingest_turn(&incoming))?;
            let record = self.conversations.get(message_id)?;
            if let Some(closed) = self.monitor.track(record) {
                self.spawn_window_task(closed).await;
            }
            message_id
        };

        if !incoming.addressed {
            return Ok(None);
        }

        let reply = match self.respond(&incoming, message_id).await {
            Ok(text) => {
                self.persist_reply(&incoming, &text).await?;
                text
            }
            Err(EngineError::Context(ContextError::BudgetExceeded)) => {
                warn!(chat_id = incoming.chat_id, "immediate layer over budget");
                self.config.persona.too_long_template.clone()
            }
            Err(EngineError::Llm(LlmError::RateLimited { retry_after_ms })) => {
                warn!(chat_id = incoming.chat_id, retry_after_ms, "generation rate limited");
                self.config.persona.rate_limited_template.clone()
            }
            Err(e) => {
                error!(chat_id = incoming.chat_id, error = %e, "generation failed");
                self.config.persona.error_template.clone()
            }
        };
        Ok(Some(reply))
    }

    async fn respond(
        self: &Arc<Self>,
        incoming: &IncomingMessage,
        message_id: i64,
    ) -> Result<String, EngineError> {
        let bundle = self
            .assembler
            .assemble(&ContextRequest {
                chat_id: incoming.chat_id,
                thread_id: incoming.thread_id,
                user_id: incoming.user_id,
                query_text: incoming.text.clone(),
                token_budget: self.config.context.token_budget,
            })
            .await?;

        let system_prompt = self.prompts.get_active_prompt(Some(incoming.chat_id))?;
        let caps = capability::detect(&self.config.llm.model, &self.config.capability);

        let mut history;
        let mut user_parts;
        let mut system_context = format::system_context(&bundle);
        match self.config.context.output_format {
            OutputFormat::Structured => {
                let mut context_messages = bundle.relevant.clone();
                context_messages.sort_by_key(|m| (m.created_at, m.id));
                context_messages.extend(
                    bundle
                        .conversation()
                        .into_iter()
                        .filter(|m| m.id != message_id),
                );
                history = format::structured_history(
                    &context_messages,
                    self.config.persona.bot_user_id,
                );
                user_parts = Vec::new();
                if !incoming.text.is_empty() {
                    user_parts.push(Part::text(incoming.text.clone()));
                }
                for media in &incoming.media {
                    user_parts.push(Part::Media {
                        media: media.clone(),
                    });
                }
            }
            OutputFormat::Compact => {
                let transcript = format::compact_transcript(
                    &bundle.conversation(),
                    self.config.persona.bot_user_id,
                    &self.config.persona.bot_display_name,
                );
                history = Vec::new();
                user_parts = vec![Part::text(transcript)];
                // media still goes alongside for capable models
                for media in &incoming.media {
                    user_parts.push(Part::Media {
                        media: media.clone(),
                    });
                }
                if !bundle.relevant.is_empty() {
                    let related = bundle
                        .relevant
                        .iter()
                        .map(|m| m.text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n");
                    system_context = Some(match system_context {
                        Some(existing) => format!("{existing}\n\nRelated messages:\n{related}"),
                        None => format!("Related messages:\n{related}"),
                    });
                }
            }
        }

        capability::filter_media(&caps, &mut history, &mut user_parts, &self.telemetry);

        let tools = if caps.supports_tools {
            self.dispatcher.definitions()
        } else {
            Vec::new()
        };
        let mut request = GenerateRequest {
            model: self.config.llm.model.clone(),
            system_prompt,
            system_context,
            history,
            user_parts,
            tools,
            max_output_tokens: self.config.llm.max_output_tokens,
        };

        let invocation = ToolInvocation {
            chat_id: incoming.chat_id,
            user_id: incoming.user_id,
            message_id: Some(message_id),
            now: epoch_now(),
            is_admin: self
                .config
                .persona
                .admin_user_ids
                .contains(&incoming.user_id),
        };

        let mut response = self.generate(&request).await?;
        for round in 0..MAX_TOOL_ROUNDS {
            if response.tool_calls.is_empty() {
                break;
            }
            debug!(round, calls = response.tool_calls.len(), "tool round");

            let mut results = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                let result = self.dispatcher.dispatch(&invocation, call).await;
                results.push(serde_json::json!({
                    "tool": call.name,
                    "id": call.id,
                    "result": result,
                }));
            }

            // Fold the exchange into history and ask again.
            let calls_json = serde_json::to_string(&response.tool_calls)
                .unwrap_or_else(|_| "[]".to_string());
            request.history.push(Turn {
                role: Role::Model,
                parts: vec![Part::text(format!("[tool_calls] {calls_json}"))],
            });
            let results_json =
                serde_json::to_string(&results).unwrap_or_else(|_| "[]".to_string());
            request.history.push(Turn {
                role: Role::User,
                parts: vec![Part::text(format!("[tool_results] {results_json}"))],
            });
            response = self.generate(&request).await?;
        }

        Ok(response.text)
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, EngineError> {
        let _permit = self
            .llm_permits
            .acquire()
            .await
            .expect("llm semaphore closed");
        let deadline = Duration::from_secs(self.config.llm.request_timeout_seconds);
        match tokio::time::timeout(deadline, self.llm.generate(request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(LlmError::Transient("generation deadline exceeded".to_string()).into()),
        }
    }

    async fn persist_reply(self: &Arc<Self>, incoming: &IncomingMessage, text: &str) -> Result<(), EngineError> {
        let key = (incoming.chat_id, incoming.thread_id);
        let lock = self.conv_lock(&self.ingest_locks, key);
        let _guard = lock.lock().await;

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "display_name".to_string(),
            self.config.persona.bot_display_name.clone(),
        );
        let message_id = self.conversations.add_turn(&NewTurn {
            chat_id: incoming.chat_id,
            thread_id: incoming.thread_id,
            user_id: self.config.persona.bot_user_id,
            role: Role::Model,
            text: text.to_string(),
            media: Vec::new(),
            metadata,
            external: Default::default(),
            embedding: None,
            created_at: epoch_now(),
        })?;
        let record = self.conversations.get(message_id)?;
        if let Some(closed) = self.monitor.track(record) {
            self.spawn_window_task(closed).await;
        }
        Ok(())
    }

    /// Acquire the per-conversation extraction lock *now*, then process
    /// the window on a background task holding the guard. Acquisition
    /// order equals close order, so windows never overtake each other.
    async fn spawn_window_task(self: &Arc<Self>, closed: ClosedWindow) {
        let key = (closed.window.chat_id, closed.window.thread_id);
        let lock = self.conv_lock(&self.extraction_locks, key);
        let guard = lock.lock_owned().await;
        let processor = Arc::clone(&self.processor);
        let handle = tokio::spawn(async move {
            let _guard: OwnedMutexGuard<()> = guard;
            processor.process(closed).await;
        });
        self.tasks.lock().unwrap().push(handle);
    }

    fn conv_lock(
        &self,
        map: &DashMap<ConvKey, Arc<AsyncMutex<()>>>,
        key: ConvKey,
    ) -> Arc<AsyncMutex<()>> {
        map.entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Start the background loops: retention pruning, the window sweep,
    /// and embedding backfill. Each loop exits on the shutdown signal.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(retention_loop(
            Arc::clone(self),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(sweep_loop(
            Arc::clone(self),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(backfill_loop(
            Arc::clone(self),
            self.shutdown_tx.subscribe(),
        )));
        info!("background loops started");
    }

    /// Graceful shutdown: signal the loops, flush open windows, then wait
    /// out in-flight background work for a bounded grace period.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("engine shutting down");
        let _ = self.shutdown_tx.send(true);

        for closed in self.monitor.drain() {
            self.spawn_window_task(closed).await;
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        let flush = futures_util::future::join_all(tasks);
        if tokio::time::timeout(SHUTDOWN_GRACE, flush).await.is_err() {
            warn!("shutdown grace expired with work still in flight");
        }
        info!("engine stopped");
    }
}

fn ingest_turn(incoming: &IncomingMessage) -> NewTurn {
    let mut metadata = BTreeMap::new();
    metadata.insert("display_name".to_string(), incoming.display_name.clone());
    if let Some(username) = &incoming.username {
        metadata.insert("username".to_string(), username.clone());
    }
    NewTurn {
        chat_id: incoming.chat_id,
        thread_id: incoming.thread_id,
        user_id: incoming.user_id,
        role: Role::User,
        text: incoming.text.clone(),
        media: incoming.media.clone(),
        metadata,
        external: incoming.external.clone(),
        embedding: None,
        created_at: incoming.timestamp,
    }
}

/// Daily (by default) retention pruning.
async fn retention_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    if !engine.config.retention.enabled {
        return;
    }
    let period = Duration::from_secs(engine.config.retention.prune_interval_seconds.max(1));
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // immediate first tick is skipped
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let conversations = Arc::clone(&engine.conversations);
                let days = engine.config.retention.days;
                let result = tokio::task::spawn_blocking(move || conversations.prune(days)).await;
                match result {
                    Ok(Ok(deleted)) => debug!(deleted, "retention tick"),
                    Ok(Err(e)) => error!(error = %e, "retention prune failed"),
                    Err(e) => error!(error = %e, "retention task panicked"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Periodic window-timeout sweep.
async fn sweep_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(engine.config.episodes.monitor_interval_seconds.max(1));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for closed in engine.monitor.sweep(epoch_now()) {
                    engine.spawn_window_task(closed).await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Embedding backfill for messages stored without one.
async fn backfill_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(BACKFILL_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let pending = match engine.conversations.unembedded(BACKFILL_BATCH) {
                    Ok(pending) => pending,
                    Err(e) => {
                        error!(error = %e, "backfill query failed");
                        continue;
                    }
                };
                if pending.is_empty() {
                    continue;
                }
                let texts: Vec<String> = pending.iter().map(|(_, text)| text.clone()).collect();
                match engine.embedder.embed_batch(&texts).await {
                    Ok(vectors) => {
                        for ((id, _), vector) in pending.iter().zip(vectors) {
                            if let Err(e) = engine.conversations.set_embedding(*id, &vector) {
                                warn!(message_id = id, error = %e, "embedding backfill write failed");
                            }
                        }
                        debug!(count = pending.len(), "embeddings backfilled");
                    }
                    Err(e) => warn!(error = %e, "embedding backfill batch failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
