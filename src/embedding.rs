//! Deterministic feature-hashing embedder.
//!
//! Each lowercase word is hashed with SHA-256 into one of `dimensions`
//! buckets with a sign bit, and the resulting vector is L2-normalised.
//! Texts sharing words land close together under cosine similarity, which
//! is enough to exercise vector search without a model download.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uir_search::{Embedder, ProviderError};

/// Embeds text by hashing words into a fixed number of buckets.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
    model: String,
}

impl HashEmbedder {
    /// Create an embedder producing `dimensions`-wide vectors.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            model: format!("hash-{dimensions}"),
        }
    }

    /// Output width.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed synchronously.
    #[must_use]
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for word in crate::providers::tokenize(text) {
            let digest = Sha256::digest(word.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]);
            // usize fits in u64 on every supported target.
            let index = (bucket % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str, deadline: Instant) -> Result<Vec<f32>, ProviderError> {
        if Instant::now() >= deadline {
            return Err(ProviderError::Timeout(format!(
                "{} embedding deadline passed",
                self.model
            )));
        }
        Ok(self.embed_text(text))
    }
}
