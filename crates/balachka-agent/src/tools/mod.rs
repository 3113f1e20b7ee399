//! LLM-callable memory tools.
//!
//! A closed registry: every tool is a typed handler with a JSON schema,
//! and dispatch is a table lookup — nothing dynamic. Tool failures are
//! values, not panics; the dispatcher renders them as compact JSON error
//! payloads for the model.

pub mod dispatcher;
pub mod forget;
pub mod recall_facts;
pub mod remember_fact;
pub mod update_fact;
pub mod update_pronouns;

use std::sync::Arc;

use async_trait::async_trait;

use balachka_core::types::Entity;
use balachka_memory::error::StoreError;
use balachka_memory::facts::FactStore;

/// Entity context of the message that triggered the tool call.
#[derive(Debug, Clone, Copy)]
pub struct ToolInvocation {
    pub chat_id: i64,
    pub user_id: i64,
    /// Internal id of the triggering message, recorded as fact evidence.
    pub message_id: Option<i64>,
    pub now: i64,
    pub is_admin: bool,
}

impl ToolInvocation {
    /// Resolve the `about` argument into a fact entity. User facts carry
    /// the chat as learning context.
    pub fn entity(&self, about: Option<&str>) -> Result<(Entity, Option<i64>), ToolError> {
        match about.unwrap_or("user") {
            "user" => Ok((Entity::User(self.user_id), Some(self.chat_id))),
            "chat" => Ok((Entity::Chat(self.chat_id), None)),
            other => Err(ToolError::Validation(format!(
                "about must be \"user\" or \"chat\", got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not permitted: {0}")]
    NotPermitted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ToolError {
    /// Stable kind string in rendered error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotPermitted(_) => "not_permitted",
            Self::NotFound(_) => "not_found",
            Self::UnknownTool(_) => "unknown_tool",
            Self::Store(_) => "store",
        }
    }
}

/// One memory tool: name, schema, and a typed handler.
#[async_trait]
pub trait MemoryTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;
    /// Admin-only tools are rejected for ordinary users at dispatch.
    fn admin_only(&self) -> bool {
        false
    }
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError>;
}

/// The full built-in memory toolset.
pub fn memory_toolset(facts: Arc<FactStore>) -> Vec<Box<dyn MemoryTool>> {
    vec![
        Box::new(remember_fact::RememberFactTool::new(Arc::clone(&facts))),
        Box::new(recall_facts::RecallFactsTool::new(Arc::clone(&facts))),
        Box::new(update_fact::UpdateFactTool::new(Arc::clone(&facts))),
        Box::new(forget::ForgetFactTool::new(Arc::clone(&facts))),
        Box::new(forget::ForgetAllFactsTool::new(Arc::clone(&facts))),
        Box::new(update_pronouns::UpdatePronounsTool::new(facts)),
    ]
}

/// Parse and validate a category argument.
pub(crate) fn parse_category(raw: &str) -> Result<balachka_core::types::FactCategory, ToolError> {
    raw.parse()
        .map_err(|_| ToolError::Validation(format!("unknown category: {raw:?}")))
}

pub(crate) fn required_str<'a>(
    args: &'a serde_json::Value,
    field: &str,
) -> Result<&'a str, ToolError> {
    args.get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::Validation(format!("missing required parameter: {field}")))
}
