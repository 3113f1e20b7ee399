//! `recall_facts` — list or search what is known about the author or the
//! chat. Read-only.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use balachka_core::types::epoch_now;
use balachka_memory::facts::FactStore;

use super::{parse_category, MemoryTool, ToolError, ToolInvocation};

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 25;

pub struct RecallFactsTool {
    facts: Arc<FactStore>,
}

impl RecallFactsTool {
    pub fn new(facts: Arc<FactStore>) -> Self {
        Self { facts }
    }
}

#[async_trait]
impl MemoryTool for RecallFactsTool {
    fn name(&self) -> &str {
        "recall_facts"
    }

    fn description(&self) -> &str {
        "Look up stored facts about the current user (or this chat). \
         Optionally filter by category or search by free text."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "category": {
                    "type": "string",
                    "description": "Optional category filter."
                },
                "query": {
                    "type": "string",
                    "description": "Optional full-text search over keys and values."
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum facts to return (default 10)."
                },
                "about": {
                    "type": "string",
                    "description": "\"user\" (default) or \"chat\"."
                }
            },
            "required": []
        })
    }

    async fn execute(
        &self,
        invocation: &ToolInvocation,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let (entity, _) = invocation.entity(args.get("about").and_then(|v| v.as_str()))?;
        let category = args
            .get("category")
            .and_then(|v| v.as_str())
            .map(parse_category)
            .transpose()?;
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_LIMIT)
            .min(MAX_LIMIT);

        let found = match args.get("query").and_then(|v| v.as_str()) {
            Some(query) if !query.trim().is_empty() => {
                self.facts.search(entity, query, limit)?
            }
            _ => self.facts.get_facts(entity, category, None, Some(limit))?,
        };

        let now = epoch_now();
        let facts: Vec<serde_json::Value> = found
            .iter()
            .map(|f| {
                json!({
                    "category": f.category.to_string(),
                    "key": f.key,
                    "value": f.value,
                    "confidence": (f.effective_confidence(now) * 100.0).round() / 100.0,
                    "evidence_count": f.evidence_count,
                })
            })
            .collect();
        Ok(json!({"count": facts.len(), "facts": facts}))
    }
}
