//! `update_fact` — explicit correction of a known fact. This is the
//! bypass path: no dedup, no conflict rule, the new value always wins.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use balachka_core::types::FactChange;
use balachka_memory::facts::FactStore;

use super::{parse_category, required_str, MemoryTool, ToolError, ToolInvocation};

pub struct UpdateFactTool {
    facts: Arc<FactStore>,
}

impl UpdateFactTool {
    pub fn new(facts: Arc<FactStore>) -> Self {
        Self { facts }
    }
}

#[async_trait]
impl MemoryTool for UpdateFactTool {
    fn name(&self) -> &str {
        "update_fact"
    }

    fn description(&self) -> &str {
        "Correct an existing fact when the user explicitly updates it \
         (\"actually, I moved to Lviv\"). Overwrites the stored value \
         directly; use remember_fact for new observations."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "category": {
                    "type": "string",
                    "description": "Category of the existing fact."
                },
                "key": {
                    "type": "string",
                    "description": "Key of the existing fact."
                },
                "value": {
                    "type": "string",
                    "description": "The corrected value."
                },
                "confidence": {
                    "type": "number",
                    "description": "Optional new confidence 0.0-1.0."
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
            .map(|c| c.clamp(0.0, 1.0));
        let (entity, _) = invocation.entity(args.get("about").and_then(|v| v.as_str()))?;

        let Some(fact) = self.facts.find(entity, category, key)? else {
            return Err(ToolError::NotFound(format!("no active fact {category}/{key}")));
        };
        self.facts
            .update_fact(fact.id, Some(value), confidence, FactChange::Evolved)?;
        Ok(json!({"outcome": "updated", "fact_id": fact.id}))
    }
}
