//! The LLM service contract. Real HTTP clients live outside this
//! workspace; the engine only ever sees this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use balachka_core::types::{MediaDescriptor, Role};

/// One part of a turn: text or a media attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Part {
    Text { text: String },
    Media { media: MediaDescriptor },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// One turn of history in the structured prompt shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

/// Tool definition advertised to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One generation request: system prompt, optional memory context block,
/// structured history, and the final user turn.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system_prompt: String,
    /// Background + episodic summaries, separate from the persona text.
    pub system_context: Option<String>,
    pub history: Vec<Turn>,
    pub user_parts: Vec<Part>,
    /// Empty means the tools field is omitted from the outbound call.
    pub tools: Vec<ToolDefinition>,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invalid response: {0}")]
    Invalid(String),
}

/// Text generation plus embedding, behind one service handle.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, LlmError>;

    /// Embed a batch of texts into fixed-dimension vectors.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;

    /// Output dimension of `embed` — checked against stored embeddings at
    /// engine construction.
    fn embedding_dim(&self) -> usize;
}
