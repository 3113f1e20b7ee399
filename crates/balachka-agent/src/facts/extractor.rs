//! Candidate fact extraction from a closed window, per participant.
//!
//! Three tiers: deterministic regex rules (high precision, narrow
//! coverage), a hybrid pass that adds repetition scoring on top of the
//! rules, and LLM structured output (broad coverage, falls back to rules
//! on any failure). Candidates below the confidence floor never leave
//! this module.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use balachka_core::config::ExtractionMethod;
use balachka_core::types::{FactCategory, MessageRecord};

use crate::episodes::monitor::ConversationWindow;
use crate::provider::{GenerateRequest, LlmClient, Part};

/// Evidence excerpts are clipped to this many characters.
const MAX_EVIDENCE_CHARS: usize = 120;
/// Repetition bonus per extra supporting message in hybrid mode.
const REPETITION_BONUS: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct CandidateFact {
    pub category: FactCategory,
    pub key: String,
    pub value: String,
    pub confidence: f64,
    pub evidence: String,
    /// Filled in by the quality pipeline during deduplication.
    pub embedding: Option<Vec<f32>>,
}

struct ExtractionRule {
    pattern: Regex,
    category: FactCategory,
    key: &'static str,
    confidence: f64,
}

fn rule(pattern: &str, category: FactCategory, key: &'static str, confidence: f64) -> ExtractionRule {
    ExtractionRule {
        pattern: Regex::new(pattern).expect("extraction rule pattern"),
        category,
        key,
        confidence,
    }
}

/// First-person statement patterns, English and Ukrainian. Capture group
/// 1 is the fact value.
fn extraction_rules() -> Vec<ExtractionRule> {
    vec![
        rule(
            r"(?i)\bi live in ([\w][\w\s'’-]{1,39})",
            FactCategory::Location,
            "location",
            0.9,
        ),
        rule(
            r"(?i)\bi(?:'m| am) from ([\w][\w\s'’-]{1,39})",
            FactCategory::Location,
            "location",
            0.85,
        ),
        rule(
            r"(?i)я (?:живу в|живу у|з|із) ([\w][\w\s'’-]{1,39})",
            FactCategory::Location,
            "location",
            0.9,
        ),
        rule(
            r"(?i)\bmy name is ([\w][\w'’-]{1,29})",
            FactCategory::Personal,
            "name",
            0.9,
        ),
        rule(
            r"(?i)мене (?:звати|звуть) ([\w][\w'’-]{1,29})",
            FactCategory::Personal,
            "name",
            0.9,
        ),
        rule(
            r"(?i)\bi (?:love|really like) ([\w][\w\s'’-]{1,39})",
            FactCategory::Preference,
            "likes",
            0.7,
        ),
        rule(
            r"(?i)я (?:люблю|обожнюю) ([\w][\w\s'’-]{1,39})",
            FactCategory::Preference,
            "likes",
            0.7,
        ),
        rule(
            r"(?i)\bi speak ([\w]{2,20})",
            FactCategory::Language,
            "speaks",
            0.8,
        ),
        rule(
            r"(?i)я розмовляю ([\w]{2,20})",
            FactCategory::Language,
            "speaks",
            0.8,
        ),
        rule(
            r"(?i)\bi work as (?:an? )?([\w][\w\s-]{1,39})",
            FactCategory::Skill,
            "profession",
            0.8,
        ),
        rule(
            r"(?i)я працюю ([\w][\w\s-]{1,39})",
            FactCategory::Skill,
            "profession",
            0.75,
        ),
    ]
}

/// LLM structured-output item.
#[derive(Debug, Deserialize)]
struct LlmCandidate {
    category: String,
    key: String,
    value: String,
    #[serde(default = "default_llm_confidence")]
    confidence: f64,
    #[serde(default)]
    evidence: String,
}

fn default_llm_confidence() -> f64 {
    0.7
}

pub struct FactExtractor {
    client: Arc<dyn LlmClient>,
    model: String,
    method: ExtractionMethod,
    min_confidence: f64,
    rules: Vec<ExtractionRule>,
}

impl FactExtractor {
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: String,
        method: ExtractionMethod,
        min_confidence: f64,
    ) -> Self {
        Self {
            client,
            model,
            method,
            min_confidence,
            rules: extraction_rules(),
        }
    }

    /// Candidate facts about one participant of a closed window.
    pub async fn extract(&self, window: &ConversationWindow, user_id: i64) -> Vec<CandidateFact> {
        let messages: Vec<&MessageRecord> = window
            .messages
            .iter()
            .filter(|m| m.user_id == user_id && !m.text.trim().is_empty())
            .collect();
        if messages.is_empty() {
            return Vec::new();
        }

        let mut candidates = match self.method {
            ExtractionMethod::RuleBased => self.rule_based(&messages),
            ExtractionMethod::Hybrid => self.hybrid(&messages),
            ExtractionMethod::Llm => match self.llm(&messages).await {
                Some(candidates) => candidates,
                None => self.rule_based(&messages),
            },
        };
        candidates.retain(|c| c.confidence >= self.min_confidence);
        candidates
    }

    fn rule_based(&self, messages: &[&MessageRecord]) -> Vec<CandidateFact> {
        let mut out = Vec::new();
        for message in messages {
            for rule in &self.rules {
                if let Some(captures) = rule.pattern.captures(&message.text) {
                    let Some(value) = captures.get(1) else {
                        continue;
                    };
                    let value = value.as_str().trim().trim_end_matches(['.', ',', '!', '?']);
                    if value.is_empty() {
                        continue;
                    }
                    out.push(CandidateFact {
                        category: rule.category,
                        key: rule.key.to_string(),
                        value: value.to_string(),
                        confidence: rule.confidence,
                        evidence: clip(&message.text),
                        embedding: None,
                    });
                }
            }
        }
        out
    }

    /// Rules plus repetition scoring: a fact restated in several messages
    /// earns a confidence bonus per extra occurrence.
    fn hybrid(&self, messages: &[&MessageRecord]) -> Vec<CandidateFact> {
        let raw = self.rule_based(messages);
        let mut merged: Vec<CandidateFact> = Vec::new();
        for candidate in raw {
            match merged.iter_mut().find(|m| {
                m.category == candidate.category
                    && m.key == candidate.key
                    && m.value.to_lowercase() == candidate.value.to_lowercase()
            }) {
                Some(existing) => {
                    existing.confidence =
                        (existing.confidence.max(candidate.confidence) + REPETITION_BONUS).min(1.0);
                }
                None => merged.push(candidate),
            }
        }
        merged
    }

    async fn llm(&self, messages: &[&MessageRecord]) -> Option<Vec<CandidateFact>> {
        let transcript = messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let categories = FactCategory::ALL
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join("|");
        let prompt = format!(
            "Extract durable facts about the AUTHOR of these chat messages. \
             Return ONLY a JSON array; each element: \
             {{\"category\": \"{categories}\", \"key\": \"short_snake_case\", \
             \"value\": \"brief\", \"confidence\": 0.0-1.0, \
             \"evidence\": \"short quote\"}}. \
             Maximum 10 items. Skip small talk. Empty array if nothing.\n\n{transcript}"
        );
        let request = GenerateRequest {
            model: self.model.clone(),
            system_prompt: "You are a precise fact extractor.".to_string(),
            system_context: None,
            history: Vec::new(),
            user_parts: vec![Part::text(prompt)],
            tools: Vec::new(),
            max_output_tokens: 512,
        };

        let response = match self.client.generate(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "fact extraction call failed, falling back to rules");
                return None;
            }
        };

        let raw = response.text.trim();
        let slice = match (raw.find('['), raw.rfind(']')) {
            (Some(start), Some(end)) if end > start => &raw[start..=end],
            _ => raw,
        };
        let parsed: Vec<LlmCandidate> = match serde_json::from_str(slice) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "fact extraction parse failed, falling back to rules");
                return None;
            }
        };

        Some(
            parsed
                .into_iter()
                .filter_map(|item| {
                    let category: FactCategory = item.category.parse().ok()?;
                    if item.key.trim().is_empty() || item.value.trim().is_empty() {
                        return None;
                    }
                    Some(CandidateFact {
                        category,
                        key: item.key,
                        value: item.value,
                        confidence: item.confidence.clamp(0.0, 1.0),
                        evidence: clip(&item.evidence),
                        embedding: None,
                    })
                })
                .collect(),
        )
    }
}

fn clip(text: &str) -> String {
    text.chars().take(MAX_EVIDENCE_CHARS).collect()
}
