//! # uir-search
//!
//! Provider orchestration and result fusion for uir.
//!
//! One query interface over many independent retrieval backends: web
//! search engines, vector databases, document stores. This crate decides
//! which backends to query, protects callers from failing backends, runs
//! queries concurrently, fuses the ranked lists into one and caches the
//! outcome. Backends plug in through [`ProviderAdapter`].
//!
//! ## Design
//!
//! - Per-provider circuit breaker, rolling health and token-bucket rate
//!   limit, each provider locked independently
//! - Health-tiered provider selection with round-robin or inverse-latency
//!   tie-breaking
//! - Scatter-gather fan-out under one request deadline; calls still running
//!   at the deadline are cancelled, never leaked
//! - Reciprocal rank fusion, weighted sum, max score or plain merging, with
//!   URL and content based deduplication
//! - Two-tier cache (in-process LRU, optional Redis) keyed by a canonical
//!   request fingerprint; a cache outage only lowers the hit rate
//!
//! ## Security
//!
//! - Search queries are logged only at trace level
//! - Provider access is decided per caller by an [`AccessPolicy`]
//!
//! ## Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use uir_search::*;
//! # async fn example(adapter: Arc<dyn ProviderAdapter>) -> uir_search::Result<()> {
//! let config = EngineConfig::default();
//! let router = RouterBuilder::new(config).provider(adapter, ProviderPolicy::default()).build()?;
//! let response = router
//!     .handle_search(&SearchRequest::new(["docs"], "rust async"), None)
//!     .await;
//! println!("{:?}: {} results", response.status, response.results.len());
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod aggregator;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod embedding;
pub mod error;
pub mod health;
pub mod manager;
pub mod provider;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod selector;
pub mod spans;
pub mod types;

use std::sync::Arc;

pub use access::{AccessPolicy, AllowAll};
pub use aggregator::{Aggregation, Aggregator, FusionMethod};
pub use cache::{CacheManager, CacheStats, RedisSharedCache, SharedCache};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, LoadBalancing, ProviderPolicy};
pub use embedding::Embedder;
pub use error::{ProviderError, Result, SearchError};
pub use health::{HealthState, ProviderHealth};
pub use manager::ProviderManager;
pub use provider::ProviderAdapter;
pub use registry::{ProviderRegistry, ProviderStats};
pub use router::{EngineStats, Router};
pub use selector::ProviderSelector;
pub use types::{
    Capability, Document, HybridSearchRequest, HybridStrategy, IndexRequest, IndexResponse,
    ResponseStatus, SearchOptions, SearchRequest, SearchResponse, SearchResult, StrategyKind,
    VectorQuery, VectorSearchRequest,
};

/// Assembles a [`Router`] with its registry, manager and cache.
pub struct RouterBuilder {
    config: EngineConfig,
    providers: Vec<(Arc<dyn ProviderAdapter>, ProviderPolicy)>,
    access: Arc<dyn AccessPolicy>,
    clock: Arc<dyn Clock>,
    shared_cache: Option<Arc<dyn SharedCache>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl RouterBuilder {
    /// Start from `config` with no providers, open access and the system
    /// clock.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            access: Arc::new(AllowAll),
            clock: Arc::new(SystemClock),
            shared_cache: None,
            embedder: None,
        }
    }

    /// Register a provider.
    #[must_use]
    pub fn provider(mut self, adapter: Arc<dyn ProviderAdapter>, policy: ProviderPolicy) -> Self {
        self.providers.push((adapter, policy));
        self
    }

    /// Decide provider access per caller.
    #[must_use]
    pub fn access_policy(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = access;
        self
    }

    /// Drive breaker and rate-limit timing from `clock`.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a shared cache tier.
    #[must_use]
    pub fn shared_cache(mut self, shared: Arc<dyn SharedCache>) -> Self {
        self.shared_cache = Some(shared);
        self
    }

    /// Embed text vector queries with `embedder`.
    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Validate the configuration and build the router.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Config`] if the engine config or any provider
    /// policy is invalid, or if a provider name is empty.
    pub fn build(self) -> Result<Router> {
        self.config.validate()?;
        let registry = Arc::new(ProviderRegistry::new(
            health::HealthThresholds::from(&self.config),
            self.clock,
        ));
        for (adapter, policy) in self.providers {
            registry.register(adapter, policy)?;
        }
        let selector = ProviderSelector::new(self.config.load_balancing, self.access);
        let manager = Arc::new(ProviderManager::new(registry, selector, &self.config));

        let mut cache = CacheManager::new(&self.config);
        if let Some(shared) = self.shared_cache {
            cache = cache.with_shared(shared);
        }

        let mut router = Router::new(self.config, manager, Arc::new(cache));
        if let Some(embedder) = self.embedder {
            router = router.with_embedder(embedder);
        }
        tracing::info!(
            providers = router.manager().registry().snapshot().len(),
            "router ready"
        );
        Ok(router)
    }
}
