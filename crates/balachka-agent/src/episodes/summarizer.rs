//! Episode summarizer: LLM structured output with a deterministic
//! heuristic fallback, so window closure can never fail on a flaky model.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use balachka_core::types::Valence;

use crate::provider::{GenerateRequest, LlmClient, Part};

use super::monitor::{CloseReason, ConversationWindow};

/// Messages sent to the topic-only fast path.
const TOPIC_FAST_PATH_MESSAGES: usize = 5;
/// Heuristic topic length.
const HEURISTIC_TOPIC_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct EpisodeSummary {
    pub topic: String,
    pub summary: String,
    pub valence: Valence,
    pub tags: Vec<String>,
    pub key_points: Vec<String>,
}

/// Raw structured output requested from the model.
#[derive(Debug, Deserialize)]
struct SummaryPayload {
    topic: String,
    summary: String,
    #[serde(default)]
    valence: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    key_points: Vec<String>,
}

pub struct EpisodeSummarizer {
    client: Arc<dyn LlmClient>,
    model: String,
}

impl EpisodeSummarizer {
    pub fn new(client: Arc<dyn LlmClient>, model: String) -> Self {
        Self { client, model }
    }

    /// Summarize a closed window. Any transport or parse failure falls
    /// back to heuristics; this function always produces a summary.
    pub async fn summarize(
        &self,
        window: &ConversationWindow,
        reason: CloseReason,
    ) -> EpisodeSummary {
        let transcript = transcript(window);
        let prompt = format!(
            "Summarize this group-chat excerpt. Return ONLY a JSON object: \
             {{\"topic\": \"3-6 words\", \"summary\": \"2-3 sentences\", \
             \"valence\": \"positive|negative|neutral|mixed\", \
             \"tags\": [\"..\"], \"key_points\": [\"..\"]}}.\n\n{transcript}"
        );

        match self.structured_call(&prompt).await {
            Some(payload) => EpisodeSummary {
                topic: payload.topic,
                summary: payload.summary,
                valence: payload
                    .valence
                    .as_deref()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(Valence::Neutral),
                tags: payload.tags,
                key_points: payload.key_points,
            },
            None => heuristic_summary(window, reason),
        }
    }

    /// Fast path: a short topic from the first few messages only.
    pub async fn generate_topic_only(&self, window: &ConversationWindow) -> String {
        let head: Vec<_> = window
            .messages
            .iter()
            .take(TOPIC_FAST_PATH_MESSAGES)
            .cloned()
            .collect();
        let head_window = ConversationWindow {
            messages: head,
            ..window.clone()
        };
        let prompt = format!(
            "Name the topic of this chat excerpt in 3-6 words. Return ONLY a \
             JSON object: {{\"topic\": \"..\", \"summary\": \"\"}}.\n\n{}",
            transcript(&head_window)
        );
        match self.structured_call(&prompt).await {
            Some(payload) if !payload.topic.trim().is_empty() => payload.topic,
            _ => heuristic_topic(window),
        }
    }

    /// Fast path: valence classification with heuristic fallback.
    pub async fn detect_valence(&self, window: &ConversationWindow) -> Valence {
        let prompt = format!(
            "Classify the emotional tone of this chat excerpt. Return ONLY a \
             JSON object: {{\"topic\": \"\", \"summary\": \"\", \
             \"valence\": \"positive|negative|neutral|mixed\"}}.\n\n{}",
            transcript(window)
        );
        self.structured_call(&prompt)
            .await
            .and_then(|payload| payload.valence?.parse().ok())
            .unwrap_or(Valence::Neutral)
    }

    async fn structured_call(&self, prompt: &str) -> Option<SummaryPayload> {
        let request = GenerateRequest {
            model: self.model.clone(),
            system_prompt: "You are a precise conversation summarizer.".to_string(),
            system_context: None,
            history: Vec::new(),
            user_parts: vec![Part::text(prompt)],
            tools: Vec::new(),
            max_output_tokens: 512,
        };
        let response = match self.client.generate(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "summarizer call failed, using heuristics");
                return None;
            }
        };
        match parse_json_object(&response.text) {
            Some(payload) => Some(payload),
            None => {
                warn!(raw = %response.text, "summary parse failed, using heuristics");
                None
            }
        }
    }
}

/// Extract and parse the first JSON object in a model reply, tolerating
/// code fences and preamble text.
fn parse_json_object(raw: &str) -> Option<SummaryPayload> {
    let trimmed = raw.trim();
    let slice = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    };
    serde_json::from_str(slice).ok()
}

fn transcript(window: &ConversationWindow) -> String {
    window
        .messages
        .iter()
        .map(|m| {
            let name = m
                .metadata
                .get("display_name")
                .map(String::as_str)
                .unwrap_or("user");
            format!("{name}: {}", m.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deterministic fallback when the model is unavailable or returns junk.
fn heuristic_summary(window: &ConversationWindow, reason: CloseReason) -> EpisodeSummary {
    EpisodeSummary {
        topic: heuristic_topic(window),
        summary: format!(
            "Conversation with {} participant(s) over {} message(s)",
            window.participants.len(),
            window.messages.len()
        ),
        valence: Valence::Neutral,
        tags: vec![reason.tag().to_string()],
        key_points: Vec::new(),
    }
}

fn heuristic_topic(window: &ConversationWindow) -> String {
    window
        .messages
        .iter()
        .find(|m| !m.text.trim().is_empty())
        .map(|m| m.text.chars().take(HEURISTIC_TOPIC_CHARS).collect())
        .unwrap_or_else(|| "conversation".to_string())
}
