//! Trait definition for pluggable search providers.
//!
//! Each backend (a keyword index, a vector store, a web API) implements
//! [`ProviderAdapter`] so the manager can call it uniformly. Adapters
//! translate between the engine's request types and the backend's wire
//! format; they do not retry, time out or track health themselves.

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::ProviderError;
use crate::types::{Capability, Document, SearchOptions, SearchResult, VectorQuery};

/// A pluggable search backend.
///
/// All implementations must be `Send + Sync` for concurrent fan-out.
/// Every call receives the deadline the manager will enforce, so adapters
/// that speak to remote services can forward it as their own timeout.
///
/// Results must carry `provider == self.name()` and be ordered best-first.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Returns the unique provider name.
    fn name(&self) -> &str;

    /// Operations this backend supports.
    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Search]
    }

    /// Keyword search.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the backend fails or rejects the query.
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
        deadline: Instant,
    ) -> Result<Vec<SearchResult>, ProviderError>;

    /// Nearest-neighbour search.
    ///
    /// # Errors
    ///
    /// The default implementation returns [`ProviderError::Unsupported`].
    async fn vector_search(
        &self,
        _query: &VectorQuery,
        _options: &SearchOptions,
        _deadline: Instant,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        Err(ProviderError::Unsupported(format!(
            "{} does not support vector search",
            self.name()
        )))
    }

    /// Ingest documents, returning how many were accepted.
    ///
    /// # Errors
    ///
    /// The default implementation returns [`ProviderError::Unsupported`].
    async fn index(
        &self,
        _documents: &[Document],
        _index_name: Option<&str>,
        _deadline: Instant,
    ) -> Result<usize, ProviderError> {
        Err(ProviderError::Unsupported(format!(
            "{} does not support indexing",
            self.name()
        )))
    }

    /// Cheap liveness probe used by the background health monitor.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the backend is unreachable.
    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// A mock provider for testing trait bounds and default methods.
    struct MockProvider {
        results: Vec<SearchResult>,
    }

    #[async_trait]
    impl ProviderAdapter for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn search(
            &self,
            _query: &str,
            _options: &SearchOptions,
            _deadline: Instant,
        ) -> Result<Vec<SearchResult>, ProviderError> {
            if self.results.is_empty() {
                return Err(ProviderError::Upstream("mock provider failure".into()));
            }
            Ok(self.results.clone())
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[test]
    fn provider_is_object_safe() {
        let provider: Arc<dyn ProviderAdapter> = Arc::new(MockProvider { results: vec![] });
        assert_eq!(provider.name(), "mock");
        assert_eq!(provider.capabilities(), vec![Capability::Search]);
    }

    #[tokio::test]
    async fn mock_provider_returns_results() {
        let provider = MockProvider {
            results: vec![SearchResult::new("1", "mock", 0.9)],
        };
        let results = provider
            .search("test", &SearchOptions::default(), deadline())
            .await
            .expect("should succeed");
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn mock_provider_propagates_errors() {
        let provider = MockProvider { results: vec![] };
        let err = provider
            .search("test", &SearchOptions::default(), deadline())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mock provider failure"));
    }

    #[tokio::test]
    async fn default_vector_search_is_unsupported() {
        let provider = MockProvider { results: vec![] };
        let query = VectorQuery {
            vector: vec![0.1, 0.2],
            index: None,
            namespace: None,
        };
        let err = provider
            .vector_search(&query, &SearchOptions::default(), deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }

    #[tokio::test]
    async fn default_index_is_unsupported() {
        let provider = MockProvider { results: vec![] };
        let err = provider.index(&[], None, deadline()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
        assert!(provider.health_check().await.is_ok());
    }
}
