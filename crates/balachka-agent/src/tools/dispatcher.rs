//! Tool dispatch: argument validation against each tool's JSON schema,
//! permission checks, execution, and compact rendering of the result.
//!
//! Results go back to the model as minified JSON with sorted keys; a
//! result over the token budget is shrunk by trimming its arrays before
//! being replaced by an error payload as the last resort. Errors are
//! payloads too — dispatch never raises.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::pipeline::tokens::estimate_text;
use crate::provider::{ToolCall, ToolDefinition};
use crate::telemetry::Telemetry;

use super::{MemoryTool, ToolError, ToolInvocation};

pub struct ToolDispatcher {
    tools: Vec<Box<dyn MemoryTool>>,
    max_result_tokens: usize,
    telemetry: Arc<Telemetry>,
}

impl ToolDispatcher {
    pub fn new(
        tools: Vec<Box<dyn MemoryTool>>,
        max_result_tokens: usize,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            tools,
            max_result_tokens,
            telemetry,
        }
    }

    /// API-level definitions for the capability-gated tools field.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    /// Execute one tool call and render the result for the model.
    pub async fn dispatch(&self, invocation: &ToolInvocation, call: &ToolCall) -> String {
        let started = Instant::now();
        Telemetry::incr(&self.telemetry.tool_calls);

        let (rendered, kind) = match self.run(invocation, call).await {
            Ok(value) => (self.render(value), "ok"),
            Err(e) => {
                Telemetry::incr(&self.telemetry.tool_errors);
                warn!(tool = %call.name, error = %e, "tool call failed");
                (
                    self.render(json!({"error": e.to_string(), "kind": e.kind()})),
                    e.kind(),
                )
            }
        };

        let elapsed = started.elapsed().as_millis() as u64;
        Telemetry::add(&self.telemetry.tool_latency_ms_total, elapsed);
        debug!(tool = %call.name, kind, elapsed_ms = elapsed, "tool call complete");
        rendered
    }

    async fn run(&self, invocation: &ToolInvocation, call: &ToolCall) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        if tool.admin_only() && !invocation.is_admin {
            return Err(ToolError::NotPermitted(format!(
                "{} is admin-only",
                tool.name()
            )));
        }
        validate_args(&tool.input_schema(), &call.args)?;
        tool.execute(invocation, call.args.clone()).await
    }

    /// Minified JSON (serde_json maps iterate in sorted key order),
    /// shrunk to the token budget.
    fn render(&self, mut value: Value) -> String {
        let mut out = value.to_string();
        while estimate_text(&out) > self.max_result_tokens {
            if !shrink_largest_array(&mut value) {
                return json!({"error": "result too large", "kind": "oversize"}).to_string();
            }
            out = value.to_string();
        }
        out
    }
}

/// Validate arguments against a tool schema: required fields present,
/// declared property types respected, no undeclared properties.
fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let args_object = args
        .as_object()
        .ok_or_else(|| ToolError::Validation("arguments must be an object".to_string()))?;
    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !args_object.contains_key(field) {
                return Err(ToolError::Validation(format!(
                    "missing required parameter: {field}"
                )));
            }
        }
    }

    for (name, value) in args_object {
        let Some(declared) = properties.get(name) else {
            return Err(ToolError::Validation(format!("unknown parameter: {name}")));
        };
        let expected = declared.get("type").and_then(|t| t.as_str()).unwrap_or("string");
        let matches = match expected {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !matches {
            return Err(ToolError::Validation(format!(
                "parameter {name} must be a {expected}"
            )));
        }
    }
    Ok(())
}

/// Pop one element off the largest array in the value. Returns false when
/// there is nothing left to shrink.
fn shrink_largest_array(value: &mut Value) -> bool {
    fn largest<'a>(value: &'a mut Value) -> Option<&'a mut Vec<Value>> {
        match value {
            Value::Array(items) if !items.is_empty() => Some(items),
            Value::Object(map) => map
                .values_mut()
                .filter_map(largest)
                .max_by_key(|items| items.len()),
            _ => None,
        }
    }
    match largest(value) {
        Some(items) => {
            items.pop();
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::memory_toolset;
    use balachka_memory::db::Database;
    use balachka_memory::facts::FactStore;

    fn dispatcher() -> (Arc<FactStore>, ToolDispatcher, Arc<Telemetry>) {
        let db = Database::open_in_memory().unwrap();
        let facts = Arc::new(FactStore::new(db, 0.85));
        let telemetry = Arc::new(Telemetry::default());
        let dispatcher = ToolDispatcher::new(
            memory_toolset(Arc::clone(&facts)),
            300,
            Arc::clone(&telemetry),
        );
        (facts, dispatcher, telemetry)
    }

    fn invocation() -> ToolInvocation {
        ToolInvocation {
            chat_id: -100,
            user_id: 42,
            message_id: Some(7),
            now: 1_000,
            is_admin: false,
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "call-1".to_string(),
            name: name.to_string(),
            args,
        }
    }

    #[tokio::test]
    async fn remember_then_recall_round_trips() {
        let (_, dispatcher, _) = dispatcher();
        let out = dispatcher
            .dispatch(
                &invocation(),
                &call(
                    "remember_fact",
                    json!({"category": "location", "key": "location", "value": "Kyiv"}),
                ),
            )
            .await;
        assert!(out.contains("\"outcome\":\"created\""), "got {out}");

        let out = dispatcher
            .dispatch(&invocation(), &call("recall_facts", json!({})))
            .await;
        assert!(out.contains("\"kyiv\""), "got {out}");
        assert!(out.contains("\"count\":1"), "got {out}");
        // minified: no whitespace after separators
        assert!(!out.contains("\": "), "got {out}");
    }

    #[tokio::test]
    async fn double_remember_reinforces_once() {
        let (facts, dispatcher, _) = dispatcher();
        let args = json!({"category": "personal", "key": "location", "value": "Kyiv", "confidence": 0.8});
        dispatcher
            .dispatch(&invocation(), &call("remember_fact", args.clone()))
            .await;
        let out = dispatcher
            .dispatch(&invocation(), &call("remember_fact", args))
            .await;
        assert!(out.contains("\"outcome\":\"reinforced\""), "got {out}");

        let stored = facts
            .get_facts(balachka_core::types::Entity::User(42), None, None, None)
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].evidence_count, 2);
    }

    #[tokio::test]
    async fn missing_required_parameter_is_a_validation_error() {
        let (_, dispatcher, telemetry) = dispatcher();
        let out = dispatcher
            .dispatch(
                &invocation(),
                &call("remember_fact", json!({"category": "personal"})),
            )
            .await;
        assert!(out.contains("\"kind\":\"validation\""), "got {out}");
        assert_eq!(telemetry.snapshot().tool_errors, 1);
    }

    #[tokio::test]
    async fn undeclared_parameter_is_rejected() {
        let (_, dispatcher, _) = dispatcher();
        let out = dispatcher
            .dispatch(
                &invocation(),
                &call(
                    "remember_fact",
                    json!({"category": "personal", "key": "k", "value": "v", "mood": "great"}),
                ),
            )
            .await;
        assert!(out.contains("\"kind\":\"validation\""), "got {out}");
    }

    #[tokio::test]
    async fn wrong_type_is_rejected() {
        let (_, dispatcher, _) = dispatcher();
        let out = dispatcher
            .dispatch(
                &invocation(),
                &call(
                    "remember_fact",
                    json!({"category": "personal", "key": "k", "value": "v", "confidence": "high"}),
                ),
            )
            .await;
        assert!(out.contains("\"kind\":\"validation\""), "got {out}");
    }

    #[tokio::test]
    async fn admin_only_tool_refuses_ordinary_users() {
        let (_, dispatcher, _) = dispatcher();
        let out = dispatcher
            .dispatch(&invocation(), &call("forget_all_facts", json!({})))
            .await;
        assert!(out.contains("\"kind\":\"not_permitted\""), "got {out}");

        let admin = ToolInvocation {
            is_admin: true,
            ..invocation()
        };
        let out = dispatcher
            .dispatch(&admin, &call("forget_all_facts", json!({})))
            .await;
        assert!(out.contains("\"outcome\":\"forgotten\""), "got {out}");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_payload() {
        let (_, dispatcher, _) = dispatcher();
        let out = dispatcher
            .dispatch(&invocation(), &call("launch_rockets", json!({})))
            .await;
        assert!(out.contains("\"kind\":\"unknown_tool\""), "got {out}");
    }

    #[tokio::test]
    async fn forget_fact_soft_deletes() {
        let (_, dispatcher, _) = dispatcher();
        dispatcher
            .dispatch(
                &invocation(),
                &call(
                    "remember_fact",
                    json!({"category": "preference", "key": "coffee", "value": "espresso"}),
                ),
            )
            .await;
        let out = dispatcher
            .dispatch(
                &invocation(),
                &call("forget_fact", json!({"category": "preference", "key": "coffee"})),
            )
            .await;
        assert!(out.contains("\"outcome\":\"forgotten\""), "got {out}");

        let out = dispatcher
            .dispatch(&invocation(), &call("recall_facts", json!({})))
            .await;
        assert!(out.contains("\"count\":0"), "got {out}");
    }

    #[tokio::test]
    async fn oversize_results_shrink_their_arrays() {
        let (_, dispatcher, _) = dispatcher();
        for i in 0..25 {
            dispatcher
                .dispatch(
                    &invocation(),
                    &call(
                        "remember_fact",
                        json!({
                            "category": "interest",
                            "key": format!("interest_number_{i}"),
                            "value": format!("a reasonably long interest description number {i} with extra words"),
                        }),
                    ),
                )
                .await;
        }
        let out = dispatcher
            .dispatch(&invocation(), &call("recall_facts", json!({"limit": 25})))
            .await;
        assert!(estimate_text(&out) <= 300, "result too long: {} tokens", estimate_text(&out));
        assert!(serde_json::from_str::<Value>(&out).is_ok(), "not valid JSON: {out}");
    }

    #[tokio::test]
    async fn update_pronouns_replaces_value() {
        let (facts, dispatcher, _) = dispatcher();
        dispatcher
            .dispatch(&invocation(), &call("update_pronouns", json!({"pronouns": "she/her"})))
            .await;
        let out = dispatcher
            .dispatch(&invocation(), &call("update_pronouns", json!({"pronouns": "they/them"})))
            .await;
        assert!(out.contains("\"outcome\":\"updated\""), "got {out}");

        let fact = facts
            .find(
                balachka_core::types::Entity::User(42),
                balachka_core::types::FactCategory::Personal,
                "pronouns",
            )
            .unwrap()
            .unwrap();
        assert_eq!(fact.value, "they/them");
    }
}
