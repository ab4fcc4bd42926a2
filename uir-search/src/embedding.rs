//! Text-to-vector collaborator used when a vector query arrives as text.

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::ProviderError;

/// Produces query embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, recorded in logs.
    fn model_name(&self) -> &str;

    /// Embed `text` before `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the model is unavailable.
    async fn embed(&self, text: &str, deadline: Instant) -> Result<Vec<f32>, ProviderError>;
}
