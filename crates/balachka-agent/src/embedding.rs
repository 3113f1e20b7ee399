//! Global embedding throttle: all embedding traffic from every component
//! funnels through one semaphore (≤ 5 concurrent calls) with a minimum
//! interval between batches, so background extraction can never starve
//! the interactive path of rate-limit headroom.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::provider::{LlmClient, LlmError};

/// Concurrent embedding calls allowed across the whole engine.
const MAX_CONCURRENT: usize = 5;
/// Minimum spacing between batch submissions.
const MIN_BATCH_INTERVAL: Duration = Duration::from_secs(1);

pub struct Embedder {
    client: Arc<dyn LlmClient>,
    permits: Semaphore,
    last_batch: Mutex<Option<Instant>>,
}

impl Embedder {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            permits: Semaphore::new(MAX_CONCURRENT),
            last_batch: Mutex::new(None),
        }
    }

    pub fn dim(&self) -> usize {
        self.client.embedding_dim()
    }

    /// Embed one text. No inter-call pacing — single embeds ride on the
    /// semaphore alone.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let _permit = self.permits.acquire().await.expect("semaphore closed");
        let mut vectors = self.client.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| LlmError::Invalid("empty embedding batch response".to_string()))
    }

    /// Embed a batch, enforcing the minimum inter-batch interval. Used by
    /// fact deduplication and the backfill loop.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        {
            let mut last = self.last_batch.lock().await;
            if let Some(prev) = *last {
                let since = prev.elapsed();
                if since < MIN_BATCH_INTERVAL {
                    tokio::time::sleep(MIN_BATCH_INTERVAL - since).await;
                }
            }
            *last = Some(Instant::now());
        }
        let _permit = self.permits.acquire().await.expect("semaphore closed");
        debug!(batch = texts.len(), "embedding batch");
        let vectors = self.client.embed(texts).await?;
        if vectors.len() != texts.len() {
            return Err(LlmError::Invalid(format!(
                "embedding count mismatch: {} texts, {} vectors",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{GenerateRequest, GenerateResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for CountingClient {
        fn name(&self) -> &str {
            "counting"
        }
        async fn generate(&self, _req: &GenerateRequest) -> Result<GenerateResponse, LlmError> {
            Err(LlmError::Transient("not a generator".to_string()))
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
        fn embedding_dim(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn batches_are_spaced_apart() {
        tokio::time::pause();
        let embedder = Embedder::new(Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
        }));
        let texts = vec!["a".to_string()];

        let start = Instant::now();
        embedder.embed_batch(&texts).await.unwrap();
        embedder.embed_batch(&texts).await.unwrap();
        assert!(start.elapsed() >= MIN_BATCH_INTERVAL);
    }

    #[tokio::test]
    async fn batch_length_mismatch_is_invalid() {
        struct ShortClient;
        #[async_trait]
        impl LlmClient for ShortClient {
            fn name(&self) -> &str {
                "short"
            }
            async fn generate(
                &self,
                _req: &GenerateRequest,
            ) -> Result<GenerateResponse, LlmError> {
                unreachable!()
            }
            async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
                Ok(vec![])
            }
            fn embedding_dim(&self) -> usize {
                2
            }
        }
        let embedder = Embedder::new(Arc::new(ShortClient));
        let result = embedder.embed_batch(&["x".to_string()]).await;
        assert!(matches!(result, Err(LlmError::Invalid(_))));
    }

    #[tokio::test]
    async fn embed_one_returns_single_vector() {
        let embedder = Embedder::new(Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
        }));
        let v = embedder.embed_one("hello").await.unwrap();
        assert_eq!(v.len(), 2);
    }
}
