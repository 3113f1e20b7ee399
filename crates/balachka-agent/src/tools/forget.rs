//! Forgetting tools.
//!
//! `forget_fact` soft-deletes one fact on the user's request.
//! `forget_all_facts` wipes an entity's memory and is admin-only.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use balachka_memory::facts::FactStore;

use super::{parse_category, required_str, MemoryTool, ToolError, ToolInvocation};

pub struct ForgetFactTool {
    facts: Arc<FactStore>,
}

impl ForgetFactTool {
    pub fn new(facts: Arc<FactStore>) -> Self {
        Self { facts }
    }
}

#[async_trait]
impl MemoryTool for ForgetFactTool {
    fn name(&self) -> &str {
        "forget_fact"
    }

    fn description(&self) -> &str {
        "Forget one stored fact when the user asks you to (\"forget that \
         I live in Kyiv\"). The fact stops appearing anywhere but its \
         history is kept."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "category": {
                    "type": "string",
                    "description": "Category of the fact to forget."
                },
                "key": {
                    "type": "string",
                    "description": "Key of the fact to forget."
                },
                "about": {
                    "type": "string",
                    "description": "\"user\" (default) or \"chat\"."
                }
            },
            "required": ["category", "key"]
        })
    }

    async fn execute(
        &self,
        invocation: &ToolInvocation,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let category = parse_category(required_str(&args, "category")?)?;
        let key = required_str(&args, "key")?;
        let (entity, _) = invocation.entity(args.get("about").and_then(|v| v.as_str()))?;

        let Some(fact) = self.facts.find(entity, category, key)? else {
            return Err(ToolError::NotFound(format!("no active fact {category}/{key}")));
        };
        self.facts.forget_fact(fact.id)?;
        Ok(json!({"outcome": "forgotten", "fact_id": fact.id}))
    }
}

pub struct ForgetAllFactsTool {
    facts: Arc<FactStore>,
}

impl ForgetAllFactsTool {
    pub fn new(facts: Arc<FactStore>) -> Self {
        Self { facts }
    }
}

#[async_trait]
impl MemoryTool for ForgetAllFactsTool {
    fn name(&self) -> &str {
        "forget_all_facts"
    }

    fn description(&self) -> &str {
        "Forget everything stored about the user (or this chat). \
         Admin-only; refuse politely for everyone else."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "about": {
                    "type": "string",
                    "description": "\"user\" (default) or \"chat\"."
                }
            },
            "required": []
        })
    }

    fn admin_only(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        invocation: &ToolInvocation,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let (entity, _) = invocation.entity(args.get("about").and_then(|v| v.as_str()))?;
        let count = self.facts.forget_all(entity)?;
        Ok(json!({"outcome": "forgotten", "count": count}))
    }
}
