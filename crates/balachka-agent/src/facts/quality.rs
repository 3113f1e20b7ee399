//! Quality pipeline for candidate facts: semantic dedup among the batch,
//! then conflict-aware persistence through the fact store. Embedding
//! traffic rides the global throttle; a dead embedding backend only
//! disables the semantic half of dedup.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use balachka_core::types::{cosine_similarity, Entity};
use balachka_memory::facts::{AddOutcome, FactStore, NewFact};

use crate::embedding::Embedder;
use crate::telemetry::Telemetry;

use super::extractor::CandidateFact;

/// Confidence bump applied when duplicate candidates merge.
const MERGE_CONFIDENCE_BONUS: f64 = 0.10;

#[derive(Debug, Default, Clone, Copy)]
pub struct QualityOutcome {
    pub stored: usize,
    pub reinforced: usize,
    pub superseded: usize,
    pub dropped: usize,
    pub duplicates_merged: usize,
    pub elapsed_ms: u128,
}

pub struct QualityPipeline {
    facts: Arc<FactStore>,
    embedder: Arc<Embedder>,
    duplicate_threshold: f64,
    telemetry: Arc<Telemetry>,
}

impl QualityPipeline {
    pub fn new(
        facts: Arc<FactStore>,
        embedder: Arc<Embedder>,
        duplicate_threshold: f64,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            facts,
            embedder,
            duplicate_threshold,
            telemetry,
        }
    }

    /// Run the full pipeline for one entity's candidates. Never fails:
    /// store errors drop the individual candidate and are logged.
    pub async fn process(
        &self,
        entity: Entity,
        chat_context: Option<i64>,
        source_message_id: Option<i64>,
        mut candidates: Vec<CandidateFact>,
        observed_at: i64,
    ) -> QualityOutcome {
        let started = Instant::now();
        let mut outcome = QualityOutcome::default();
        if candidates.is_empty() {
            return outcome;
        }

        self.embed_candidates(&mut candidates).await;
        let deduped = self.dedup(candidates, &mut outcome);

        for candidate in deduped {
            let new = NewFact {
                entity,
                chat_context,
                category: candidate.category,
                key: candidate.key.clone(),
                value: candidate.value.clone(),
                confidence: candidate.confidence,
                evidence_text: candidate.evidence.clone(),
                source_message_id,
                embedding: candidate.embedding.clone(),
                observed_at,
            };
            match self.facts.add_fact(&new) {
                Ok(AddOutcome::Created(_)) => {
                    outcome.stored += 1;
                    Telemetry::incr(&self.telemetry.facts_stored);
                }
                Ok(AddOutcome::Reinforced(_)) => {
                    outcome.reinforced += 1;
                    Telemetry::incr(&self.telemetry.fact_duplicates_merged);
                }
                Ok(AddOutcome::Superseded { .. }) => {
                    outcome.superseded += 1;
                    Telemetry::incr(&self.telemetry.fact_conflicts_resolved);
                }
                Ok(AddOutcome::Dropped) => outcome.dropped += 1,
                Err(e) => {
                    warn!(error = %e, key = %candidate.key, "fact persist failed");
                    outcome.dropped += 1;
                }
            }
        }

        outcome.elapsed_ms = started.elapsed().as_millis();
        debug!(
            entity = ?entity,
            stored = outcome.stored,
            reinforced = outcome.reinforced,
            superseded = outcome.superseded,
            merged = outcome.duplicates_merged,
            dropped = outcome.dropped,
            elapsed_ms = outcome.elapsed_ms,
            "fact quality pipeline complete"
        );
        outcome
    }

    /// Fill candidate embeddings in one throttled batch. Failure leaves
    /// them empty — dedup then relies on exact key/value matching only.
    async fn embed_candidates(&self, candidates: &mut [CandidateFact]) {
        let texts: Vec<String> = candidates
            .iter()
            .map(|c| format!("{}: {}", c.key, c.value))
            .collect();
        match self.embedder.embed_batch(&texts).await {
            Ok(vectors) => {
                for (candidate, vector) in candidates.iter_mut().zip(vectors) {
                    candidate.embedding = Some(vector);
                }
            }
            Err(e) => {
                warn!(error = %e, "candidate embedding failed, dedup degrades to exact match");
            }
        }
    }

    /// Collapse near-duplicates within the batch: same category plus
    /// either embedding cosine at the threshold or an exact normalized
    /// key/value match. The survivor takes the highest confidence plus a
    /// merge bonus, and inherits the merged evidence.
    fn dedup(
        &self,
        candidates: Vec<CandidateFact>,
        outcome: &mut QualityOutcome,
    ) -> Vec<CandidateFact> {
        let mut kept: Vec<CandidateFact> = Vec::new();
        for candidate in candidates {
            let duplicate_of = kept.iter_mut().find(|k| {
                k.category == candidate.category && is_duplicate(k, &candidate, self.duplicate_threshold)
            });
            match duplicate_of {
                Some(existing) => {
                    existing.confidence = (existing.confidence.max(candidate.confidence)
                        + MERGE_CONFIDENCE_BONUS)
                        .min(1.0);
                    if !candidate.evidence.is_empty()
                        && !existing.evidence.contains(&candidate.evidence)
                    {
                        if !existing.evidence.is_empty() {
                            existing.evidence.push_str("; ");
                        }
                        existing.evidence.push_str(&candidate.evidence);
                    }
                    outcome.duplicates_merged += 1;
                }
                None => kept.push(candidate),
            }
        }
        kept
    }
}

fn is_duplicate(a: &CandidateFact, b: &CandidateFact, threshold: f64) -> bool {
    if a.key.eq_ignore_ascii_case(&b.key) && a.value.to_lowercase() == b.value.to_lowercase() {
        return true;
    }
    match (a.embedding.as_deref(), b.embedding.as_deref()) {
        (Some(ea), Some(eb)) => cosine_similarity(ea, eb) >= threshold,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{GenerateRequest, GenerateResponse, LlmClient, LlmError};
    use async_trait::async_trait;
    use balachka_core::types::FactCategory;
    use balachka_memory::db::Database;

    /// Embeds deterministically: equal keys get identical vectors,
    /// different keys get clearly separated directions.
    struct ToyEmbedder;

    #[async_trait]
    impl LlmClient for ToyEmbedder {
        fn name(&self) -> &str {
            "toy"
        }
        async fn generate(&self, _req: &GenerateRequest) -> Result<GenerateResponse, LlmError> {
            unreachable!()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let first = t.split(':').next().unwrap_or("");
                    let hash: u32 = first.bytes().map(u32::from).sum();
                    let angle =
                        (hash % 97) as f32 / 97.0 * std::f32::consts::FRAC_PI_2;
                    vec![angle.cos(), angle.sin()]
                })
                .collect())
        }
        fn embedding_dim(&self) -> usize {
            2
        }
    }

    fn pipeline() -> (Arc<FactStore>, QualityPipeline) {
        let db = Database::open_in_memory().unwrap();
        let facts = Arc::new(FactStore::new(db, 0.85));
        let pipeline = QualityPipeline::new(
            Arc::clone(&facts),
            Arc::new(Embedder::new(Arc::new(ToyEmbedder))),
            0.999,
            Arc::new(Telemetry::default()),
        );
        (facts, pipeline)
    }

    fn candidate(key: &str, value: &str, confidence: f64) -> CandidateFact {
        CandidateFact {
            category: FactCategory::Preference,
            key: key.to_string(),
            value: value.to_string(),
            confidence,
            evidence: format!("said {value}"),
            embedding: None,
        }
    }

    #[tokio::test]
    async fn duplicates_merge_with_confidence_bonus() {
        let (facts, pipeline) = pipeline();
        let outcome = pipeline
            .process(
                Entity::User(42),
                None,
                None,
                vec![
                    candidate("coffee", "espresso", 0.7),
                    candidate("coffee", "Espresso", 0.65),
                ],
                1_000,
            )
            .await;

        assert_eq!(outcome.duplicates_merged, 1);
        assert_eq!(outcome.stored, 1);
        let stored = facts.get_facts(Entity::User(42), None, None, None).unwrap();
        assert_eq!(stored.len(), 1);
        // 0.7 max + 0.10 merge bonus
        assert!((stored[0].confidence - 0.8).abs() < 1e-9);
        assert!(stored[0].evidence_text.contains("said espresso"));
    }

    #[tokio::test]
    async fn pipeline_is_idempotent_for_active_state() {
        let (facts, pipeline) = pipeline();
        let batch = || {
            vec![
                candidate("coffee", "espresso", 0.8),
                candidate("tea", "green tea", 0.7),
            ]
        };

        pipeline
            .process(Entity::User(42), None, None, batch(), 1_000)
            .await;
        let first: Vec<(String, String)> = facts
            .get_facts(Entity::User(42), None, None, None)
            .unwrap()
            .into_iter()
            .map(|f| (f.key, f.value))
            .collect();

        pipeline
            .process(Entity::User(42), None, None, batch(), 1_000)
            .await;
        let second: Vec<(String, String)> = facts
            .get_facts(Entity::User(42), None, None, None)
            .unwrap()
            .into_iter()
            .map(|f| (f.key, f.value))
            .collect();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn conflicting_newer_value_supersedes_stored_fact() {
        let (facts, pipeline) = pipeline();
        pipeline
            .process(
                Entity::User(42),
                None,
                None,
                vec![candidate("coffee", "espresso", 0.8)],
                1_000,
            )
            .await;
        let outcome = pipeline
            .process(
                Entity::User(42),
                None,
                None,
                vec![candidate("coffee", "filter coffee", 0.9)],
                2_000,
            )
            .await;

        assert_eq!(outcome.superseded, 1);
        let stored = facts.get_facts(Entity::User(42), None, None, None).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value, "filter coffee");
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let (_, pipeline) = pipeline();
        let outcome = pipeline
            .process(Entity::User(42), None, None, Vec::new(), 1_000)
            .await;
        assert_eq!(outcome.stored, 0);
        assert_eq!(outcome.elapsed_ms, 0);
    }
}
