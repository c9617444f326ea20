use crate::error::ProviderError;
use crate::models::EmbeddingPurpose;
use crate::traits::EmbeddingBackend;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;

/// Batches texts through an [`EmbeddingBackend`].
///
/// A call either returns one vector per input, in input order, or nothing at all: a failure
/// in any batch discards the batches that already succeeded.
#[derive(Clone)]
pub struct EmbeddingClient {
    backend: Arc<dyn EmbeddingBackend>,
    batch_size: usize,
}

impl EmbeddingClient {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, batch_size: usize) -> Self {
        Self {
            backend,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn embed(&self, texts: &[String], purpose: EmbeddingPurpose) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }

        match self.embed_all(texts, purpose).await {
            Ok(vectors) => vectors,
            Err(failure) => {
                match &failure {
                    ProviderError::Api {
                        backend,
                        status,
                        code,
                        message,
                    } => error!(
                        backend = %backend,
                        status = *status,
                        code = code.as_deref().unwrap_or("-"),
                        message = %message,
                        inputs = texts.len(),
                        ?purpose,
                        "embedding request rejected"
                    ),
                    other => error!(
                        backend = self.backend.name(),
                        error = %other,
                        inputs = texts.len(),
                        ?purpose,
                        "embedding request failed"
                    ),
                }
                Vec::new()
            }
        }
    }

    async fn embed_all(
        &self,
        texts: &[String],
        purpose: EmbeddingPurpose,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut vectors = Vec::with_capacity(texts.len());

        for (batch_number, batch) in texts.chunks(self.batch_size).enumerate() {
            let embedded = self.backend.embed_batch(batch, purpose).await?;
            if embedded.len() != batch.len() {
                return Err(ProviderError::InvalidResponse {
                    backend: self.backend.name().to_string(),
                    details: format!(
                        "batch {} returned {} embeddings for {} inputs",
                        batch_number,
                        embedded.len(),
                        batch.len()
                    ),
                });
            }
            debug!(batch = batch_number, size = batch.len(), "embedded batch");
            vectors.extend(embedded);
        }

        Ok(vectors)
    }
}

/// Offline embedder: hashed character trigrams, L2-normalized. Ignores the purpose.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    pub dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashingEmbedder {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingBackend for HashingEmbedder {
    fn name(&self) -> &'static str {
        "hashing"
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        _purpose: EmbeddingPurpose,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}
