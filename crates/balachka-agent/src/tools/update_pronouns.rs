//! `update_pronouns` — record the user's pronouns as a high-confidence
//! personal fact, replacing any earlier value.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use balachka_core::types::{FactCategory, FactChange};
use balachka_memory::facts::{FactStore, NewFact};

use super::{required_str, MemoryTool, ToolError, ToolInvocation};

pub struct UpdatePronounsTool {
    facts: Arc<FactStore>,
}

impl UpdatePronounsTool {
    pub fn new(facts: Arc<FactStore>) -> Self {
        Self { facts }
    }
}

#[async_trait]
impl MemoryTool for UpdatePronounsTool {
    fn name(&self) -> &str {
        "update_pronouns"
    }

    fn description(&self) -> &str {
        "Record or update the user's pronouns (e.g. \"she/her\", \
         \"вони/їх\"). Always call this when someone states their \
         pronouns; the new value replaces any previous one."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pronouns": {
                    "type": "string",
                    "description": "The pronouns exactly as stated."
                }
            },
            "required": ["pronouns"]
        })
    }

    async fn execute(
        &self,
        invocation: &ToolInvocation,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let pronouns = required_str(&args, "pronouns")?;
        let (entity, chat_context) = invocation.entity(Some("user"))?;

        // A stated pronoun change always wins over the stored value.
        if let Some(existing) = self.facts.find(entity, FactCategory::Personal, "pronouns")? {
            self.facts
                .update_fact(existing.id, Some(pronouns), Some(0.95), FactChange::Corrected)?;
            return Ok(json!({"outcome": "updated", "fact_id": existing.id}));
        }

        self.facts.add_fact(&NewFact {
            entity,
            chat_context,
            category: FactCategory::Personal,
            key: "pronouns".to_string(),
            value: pronouns.to_string(),
            confidence: 0.95,
            evidence_text: String::new(),
            source_message_id: invocation.message_id,
            embedding: None,
            observed_at: invocation.now,
        })?;
        Ok(json!({"outcome": "created"}))
    }
}
