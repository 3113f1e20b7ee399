//! `remember_fact` — store one fact about the author or the chat,
//! through the full quality semantics of the fact store.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use balachka_memory::facts::{AddOutcome, FactStore, NewFact};

use super::{parse_category, required_str, MemoryTool, ToolError, ToolInvocation};

pub struct RememberFactTool {
    facts: Arc<FactStore>,
}

impl RememberFactTool {
    pub fn new(facts: Arc<FactStore>) -> Self {
        Self { facts }
    }
}

#[async_trait]
impl MemoryTool for RememberFactTool {
    fn name(&self) -> &str {
        "remember_fact"
    }

    fn description(&self) -> &str {
        "Remember a durable fact about the current user (or this chat). \
         Use when someone states something worth knowing later: location, \
         preferences, language, skills, relationships, chat norms. \
         Repeated observations reinforce the existing fact."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "category": {
                    "type": "string",
                    "description": "One of: personal, preference, skill, interest, language, location, relationship, rule, trait, style, topic, norm, culture."
                },
                "key": {
                    "type": "string",
                    "description": "Short snake_case label, e.g. \"location\" or \"favourite_food\"."
                },
                "value": {
                    "type": "string",
                    "description": "The fact itself, brief."
                },
                "confidence": {
                    "type": "number",
                    "description": "0.0-1.0, how sure you are. Default 0.8."
                },
                "evidence": {
                    "type": "string",
                    "description": "Short quote supporting the fact."
                },
                "about": {
                    "type": "string",
                    "description": "\"user\" (default) or \"chat\"."
                }
            },
            "required": ["category", "key", "value"]
        })
    }

    async fn execute(
        &self,
        invocation: &ToolInvocation,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let category = parse_category(required_str(&args, "category")?)?;
        let key = required_str(&args, "key")?;
        let value = required_str(&args, "value")?;
        let confidence = args
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.8)
            .clamp(0.0, 1.0);
        let evidence = args
            .get("evidence")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let (entity, chat_context) =
            invocation.entity(args.get("about").and_then(|v| v.as_str()))?;

        let outcome = self.facts.add_fact(&NewFact {
            entity,
            chat_context,
            category,
            key: key.to_string(),
            value: value.to_string(),
            confidence,
            evidence_text: evidence.to_string(),
            source_message_id: invocation.message_id,
            embedding: None,
            observed_at: invocation.now,
        })?;

        Ok(match outcome {
            AddOutcome::Created(id) => json!({"outcome": "created", "fact_id": id}),
            AddOutcome::Reinforced(id) => json!({"outcome": "reinforced", "fact_id": id}),
            AddOutcome::Superseded { new, .. } => json!({"outcome": "superseded", "fact_id": new}),
            AddOutcome::Dropped => json!({"outcome": "dropped"}),
        })
    }
}
