use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Token estimate for one inline media item (matches the generation API's
/// per-image accounting).
pub const INLINE_MEDIA_TOKENS: usize = 258;
/// Token estimate for one remote-URI media reference.
pub const URI_MEDIA_TOKENS: usize = 100;
/// Usernames longer than this are truncated for transcript rendering.
/// 60 is the floor — shorter truncation re-introduces a disambiguation bug.
pub const MAX_USERNAME_CHARS: usize = 60;

/// Top-level config (balachka.toml + BALACHKA_* env overrides).
///
/// Built once at startup, validated, then shared immutably. No component
/// re-reads the environment after construction.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BalachkaConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub persona: PersonaConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub episodes: EpisodeConfig,
    #[serde(default)]
    pub facts: FactQualityConfig,
    #[serde(default)]
    pub capability: CapabilityConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// The bot's own identity plus the short user-facing failure templates.
/// Templates are the only error text ever shown to a chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Reserved author id used for the bot's own turns.
    #[serde(default = "default_bot_user_id")]
    pub bot_user_id: i64,
    #[serde(default = "default_bot_name")]
    pub bot_display_name: String,
    /// Users allowed to call admin-only tools.
    #[serde(default)]
    pub admin_user_ids: Vec<i64>,
    #[serde(default = "default_base_prompt")]
    pub base_prompt: String,
    #[serde(default = "default_rate_limited_template")]
    pub rate_limited_template: String,
    #[serde(default = "default_error_template")]
    pub error_template: String,
    #[serde(default = "default_banned_template")]
    pub banned_template: String,
    #[serde(default = "default_too_long_template")]
    pub too_long_template: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            bot_user_id: default_bot_user_id(),
            bot_display_name: default_bot_name(),
            admin_user_ids: Vec::new(),
            base_prompt: default_base_prompt(),
            rate_limited_template: default_rate_limited_template(),
            error_template: default_error_template(),
            banned_template: default_banned_template(),
            too_long_template: default_too_long_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub days: u32,
    #[serde(default = "default_prune_interval")]
    pub prune_interval_seconds: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            days: default_retention_days(),
            prune_interval_seconds: default_prune_interval(),
        }
    }
}

/// Which of the two outbound prompt shapes the assembler emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Alternating user/model turns with typed parts.
    Structured,
    /// One line per turn, media as bracketed tags, `[RESPOND]` tail.
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_immediate_ratio")]
    pub immediate_ratio: f64,
    #[serde(default = "default_recent_ratio")]
    pub recent_ratio: f64,
    #[serde(default = "default_relevant_ratio")]
    pub relevant_ratio: f64,
    #[serde(default = "default_background_ratio")]
    pub background_ratio: f64,
    #[serde(default = "default_episodic_ratio")]
    pub episodic_ratio: f64,
    #[serde(default = "default_true")]
    pub relevant_enabled: bool,
    #[serde(default = "default_true")]
    pub background_enabled: bool,
    #[serde(default = "default_true")]
    pub episodic_enabled: bool,
    /// When on, the background layer splits 60/40 between user and chat facts.
    #[serde(default = "default_true")]
    pub chat_memory_enabled: bool,
    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,
    /// Wall-clock ceiling for assembling one context bundle.
    #[serde(default = "default_assembly_timeout_ms")]
    pub assembly_timeout_ms: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            immediate_ratio: default_immediate_ratio(),
            recent_ratio: default_recent_ratio(),
            relevant_ratio: default_relevant_ratio(),
            background_ratio: default_background_ratio(),
            episodic_ratio: default_episodic_ratio(),
            relevant_enabled: true,
            background_enabled: true,
            episodic_enabled: true,
            chat_memory_enabled: true,
            output_format: default_output_format(),
            assembly_timeout_ms: default_assembly_timeout_ms(),
        }
    }
}

impl ContextConfig {
    pub fn ratio_sum(&self) -> f64 {
        self.immediate_ratio
            + self.recent_ratio
            + self.relevant_ratio
            + self.background_ratio
            + self.episodic_ratio
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    /// Exponent applied to the temporal factor.
    #[serde(default = "default_temporal_weight")]
    pub temporal_weight: f64,
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Jaccard threshold above which two snippets count as duplicates.
    #[serde(default = "default_dedup_threshold")]
    pub deduplication_similarity_threshold: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            temporal_weight: default_temporal_weight(),
            half_life_days: default_half_life_days(),
            max_candidates: default_max_candidates(),
            deduplication_similarity_threshold: default_dedup_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeConfig {
    #[serde(default = "default_short_gap")]
    pub short_gap_seconds: i64,
    #[serde(default = "default_medium_gap")]
    pub medium_gap_seconds: i64,
    #[serde(default = "default_long_gap")]
    pub long_gap_seconds: i64,
    #[serde(default = "default_boundary_threshold")]
    pub boundary_threshold: f64,
    #[serde(default = "default_min_messages")]
    pub min_messages: usize,
    #[serde(default = "default_window_timeout")]
    pub window_timeout_seconds: i64,
    #[serde(default = "default_window_max_messages")]
    pub max_messages_per_window: usize,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_seconds: u64,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            short_gap_seconds: default_short_gap(),
            medium_gap_seconds: default_medium_gap(),
            long_gap_seconds: default_long_gap(),
            boundary_threshold: default_boundary_threshold(),
            min_messages: default_min_messages(),
            window_timeout_seconds: default_window_timeout(),
            max_messages_per_window: default_window_max_messages(),
            monitor_interval_seconds: default_monitor_interval(),
        }
    }
}

/// Which extraction tier proposes candidate facts from a closed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Deterministic regex patterns only.
    RuleBased,
    /// Rules plus lightweight statistical scoring.
    Hybrid,
    /// LLM structured-output extraction with rule fallback.
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactQualityConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Embedding cosine above which two candidates are the same fact.
    #[serde(default = "default_dedup_threshold")]
    pub duplicate_threshold: f64,
    #[serde(default = "default_extraction_method")]
    pub extraction_method: ExtractionMethod,
}

impl Default for FactQualityConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            duplicate_threshold: default_dedup_threshold(),
            extraction_method: default_extraction_method(),
        }
    }
}

/// Explicit model-id override lists for the capability gate. Family
/// heuristics apply when a model is in none of the lists.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapabilityConfig {
    #[serde(default)]
    pub tool_deny_list: Vec<String>,
    #[serde(default)]
    pub video_allow_list: Vec<String>,
    #[serde(default)]
    pub audio_allow_list: Vec<String>,
    /// Overrides the per-family history media cap when set.
    #[serde(default)]
    pub max_media_items: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// Token ceiling for one serialized tool result.
    #[serde(default = "default_tool_result_tokens")]
    pub tool_result_token_budget: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_output_tokens: default_max_output_tokens(),
            request_timeout_seconds: default_request_timeout(),
            max_concurrent_calls: default_max_concurrent_calls(),
            tool_result_token_budget: default_tool_result_tokens(),
        }
    }
}

impl BalachkaConfig {
    /// Load from a TOML file with BALACHKA_* env var overrides, then
    /// validate. A missing file falls back to pure defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: BalachkaConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("BALACHKA_").split("_"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Startup validation — the only place the engine is allowed to refuse
    /// to boot. Weight and ratio sums must hold within 1e-6.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = self.search.semantic_weight + self.search.keyword_weight;
        if (w - 1.0).abs() > 1e-6 {
            return Err(ConfigError::WeightSum {
                semantic: self.search.semantic_weight,
                keyword: self.search.keyword_weight,
            });
        }
        let sum = self.context.ratio_sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::RatioSum { sum });
        }
        for (field, value) in [
            ("search.semantic_weight", self.search.semantic_weight),
            ("search.keyword_weight", self.search.keyword_weight),
            ("facts.min_confidence", self.facts.min_confidence),
            ("facts.duplicate_threshold", self.facts.duplicate_threshold),
            (
                "episodes.boundary_threshold",
                self.episodes.boundary_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        Ok(())
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.balachka/balachka.db")
}
fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.balachka/balachka.toml")
}
fn default_true() -> bool {
    true
}
fn default_bot_user_id() -> i64 {
    0
}
fn default_bot_name() -> String {
    "balachka".to_string()
}
fn default_base_prompt() -> String {
    "You are balachka, a helpful group-chat assistant. Answer in the \
     language of the conversation, keep replies short, and use what you \
     know about the participants."
        .to_string()
}
fn default_rate_limited_template() -> String {
    "Забагато запитів — дай мені хвилинку відсапатись.".to_string()
}
fn default_error_template() -> String {
    "Щось пішло не так, спробуй ще раз трохи пізніше.".to_string()
}
fn default_banned_template() -> String {
    "Я з тобою не розмовляю.".to_string()
}
fn default_too_long_template() -> String {
    "Це повідомлення задовге для мене.".to_string()
}
fn default_retention_days() -> u32 {
    7
}
fn default_prune_interval() -> u64 {
    86_400
}
fn default_token_budget() -> usize {
    8_000
}
fn default_immediate_ratio() -> f64 {
    0.20
}
fn default_recent_ratio() -> f64 {
    0.30
}
fn default_relevant_ratio() -> f64 {
    0.25
}
fn default_background_ratio() -> f64 {
    0.15
}
fn default_episodic_ratio() -> f64 {
    0.10
}
fn default_output_format() -> OutputFormat {
    OutputFormat::Structured
}
fn default_assembly_timeout_ms() -> u64 {
    4_000
}
fn default_semantic_weight() -> f64 {
    0.6
}
fn default_keyword_weight() -> f64 {
    0.4
}
fn default_temporal_weight() -> f64 {
    1.0
}
fn default_half_life_days() -> f64 {
    7.0
}
fn default_max_candidates() -> usize {
    500
}
fn default_dedup_threshold() -> f64 {
    0.85
}
fn default_short_gap() -> i64 {
    120
}
fn default_medium_gap() -> i64 {
    900
}
fn default_long_gap() -> i64 {
    3_600
}
fn default_boundary_threshold() -> f64 {
    0.6
}
fn default_min_messages() -> usize {
    5
}
fn default_window_timeout() -> i64 {
    1_800
}
fn default_window_max_messages() -> usize {
    50
}
fn default_monitor_interval() -> u64 {
    300
}
fn default_min_confidence() -> f64 {
    0.6
}
fn default_extraction_method() -> ExtractionMethod {
    ExtractionMethod::Llm
}
fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_max_output_tokens() -> u32 {
    1_024
}
fn default_request_timeout() -> u64 {
    45
}
fn default_max_concurrent_calls() -> usize {
    8
}
fn default_tool_result_tokens() -> usize {
    300
}
