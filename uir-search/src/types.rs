//! Core request, result and response types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aggregator::FusionMethod;
use crate::error::{ProviderError, SearchError};

/// Free-form metadata attached to results and documents.
///
/// `serde_json`'s default map is ordered by key, so serialising a
/// `Metadata` is independent of insertion order.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A single result returned by a provider.
///
/// `id` is only unique within one provider's namespace. Fusion re-keys
/// results on a computed identity (see [`crate::aggregator::identity_key`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Provider-local identifier.
    pub id: String,
    /// Result title, if the backend has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Body text or snippet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Canonical URL, when the result is addressable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Relevance score (higher is better). Missing scores read as `0.0`.
    #[serde(default)]
    pub score: f64,
    /// Name of the provider that produced this result.
    #[serde(alias = "providerName")]
    pub provider: String,
    /// Provider and fusion metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Highlighted fragments, in provider order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlights: Option<Vec<String>>,
}

impl SearchResult {
    /// Create a bare result with only the required fields set.
    pub fn new(id: impl Into<String>, provider: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            title: None,
            content: None,
            url: None,
            score,
            provider: provider.into(),
            metadata: Metadata::new(),
            highlights: None,
        }
    }

    /// Set the URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// The score used for ranking: non-finite scores count as `0.0`.
    pub fn effective_score(&self) -> f64 {
        if self.score.is_finite() {
            self.score
        } else {
            0.0
        }
    }
}

/// Operations a provider may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Keyword / full-text search.
    Search,
    /// Nearest-neighbour search over embeddings.
    VectorSearch,
    /// Document ingestion.
    Index,
}

impl Capability {
    /// Returns the wire name of this capability.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::VectorSearch => "vector_search",
            Self::Index => "index",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cache directives carried by a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Whether the response may be served from or stored in the cache.
    pub enabled: bool,
    /// Overrides the engine's default TTL.
    pub ttl_seconds: Option<u64>,
    /// Caller-chosen key; bypasses fingerprinting.
    pub key: Option<String>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: None,
            key: None,
        }
    }
}

/// Per-request search options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Maximum number of fused results to return.
    pub limit: usize,
    /// Number of top fused results to skip.
    pub offset: usize,
    /// Overall request timeout; the engine default applies when unset.
    pub timeout_ms: Option<u64>,
    /// Drop fused results scoring below this value.
    pub min_score: Option<f64>,
    /// Collapse results that share an identity.
    pub deduplicate: bool,
    /// Fusion method name, validated before any provider call.
    pub fusion_method: Option<String>,
    /// Per-provider weights for `weighted_sum`, aligned with the provider list.
    pub weights: Option<Vec<f64>>,
    /// Providers to try if every primary provider fails.
    pub fallback_providers: Vec<String>,
    /// Caps the fan-out below the engine's `max_fan_out`.
    pub max_providers: Option<usize>,
    /// Apply query-term overlap reranking after fusion.
    pub rerank: bool,
    /// Opaque filters forwarded to providers.
    pub filters: Metadata,
    /// Cache directives.
    pub cache: CacheOptions,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            offset: 0,
            timeout_ms: None,
            min_score: None,
            deduplicate: true,
            fusion_method: None,
            weights: None,
            fallback_providers: Vec::new(),
            max_providers: None,
            rerank: false,
            filters: Metadata::new(),
            cache: CacheOptions::default(),
        }
    }
}

impl SearchOptions {
    /// Resolve and validate the requested fusion method.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::InvalidFusionMethod`] for unknown names.
    pub fn fusion(&self, default: FusionMethod) -> Result<FusionMethod, SearchError> {
        match self.fusion_method.as_deref() {
            Some(name) => name.parse(),
            None => Ok(default),
        }
    }
}

/// A keyword search across one or more providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Providers to query.
    pub providers: Vec<String>,
    /// Query text.
    pub query: String,
    /// Search options.
    #[serde(default)]
    pub options: SearchOptions,
    /// Caller identity passed to the access policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
}

impl SearchRequest {
    /// Create a request with default options.
    pub fn new<I, S>(providers: I, query: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            providers: providers.into_iter().map(Into::into).collect(),
            query: query.into(),
            options: SearchOptions::default(),
            caller: None,
        }
    }
}

/// The vector a provider searches with, plus optional scoping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorQuery {
    /// Query embedding.
    pub vector: Vec<f32>,
    /// Index to search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Namespace within the index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A vector search; either `vector` or `text` must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSearchRequest {
    /// Providers to query.
    pub providers: Vec<String>,
    /// Precomputed query embedding.
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    /// Text to embed when no vector is given.
    #[serde(default)]
    pub text: Option<String>,
    /// Index to search.
    #[serde(default)]
    pub index: Option<String>,
    /// Namespace within the index.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Search options.
    #[serde(default)]
    pub options: SearchOptions,
    /// Caller identity passed to the access policy.
    #[serde(default)]
    pub caller: Option<String>,
}

/// How one hybrid strategy retrieves results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Keyword search with `query`.
    Keyword,
    /// Vector search with `vector` or embedded `text`.
    Vector,
}

/// One leg of a hybrid search, bound to a single provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridStrategy {
    /// Retrieval kind.
    #[serde(rename = "type")]
    pub kind: StrategyKind,
    /// Provider to query.
    pub provider: String,
    /// Weight used by `weighted_sum` fusion.
    #[serde(default = "default_strategy_weight")]
    pub weight: f64,
    /// Keyword query.
    #[serde(default)]
    pub query: Option<String>,
    /// Text to embed for vector strategies.
    #[serde(default)]
    pub text: Option<String>,
    /// Precomputed vector for vector strategies.
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
}

fn default_strategy_weight() -> f64 {
    1.0
}

/// Several strategies fused into one ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridSearchRequest {
    /// Strategies to run concurrently.
    pub strategies: Vec<HybridStrategy>,
    /// Search options; `options.fusion_method` selects the fusion.
    #[serde(default)]
    pub options: SearchOptions,
    /// Caller identity passed to the access policy.
    #[serde(default)]
    pub caller: Option<String>,
}

/// A document to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier.
    pub id: String,
    /// Title.
    #[serde(default)]
    pub title: Option<String>,
    /// Body text.
    #[serde(default)]
    pub content: Option<String>,
    /// Canonical URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Precomputed embedding.
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Documents to send to a single provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRequest {
    /// Target provider.
    pub provider: String,
    /// Documents to ingest.
    pub documents: Vec<Document>,
    /// Target index.
    #[serde(default)]
    pub index_name: Option<String>,
    /// Caller identity passed to the access policy.
    #[serde(default)]
    pub caller: Option<String>,
}

/// Overall status of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Every selected provider succeeded.
    Success,
    /// At least one provider failed and at least one succeeded.
    Partial,
    /// No provider succeeded, or the request was rejected.
    Error,
}

/// What happened to one provider during a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutcome {
    /// Number of results the provider returned.
    pub result_count: usize,
    /// Wall time spent on this provider, including retries.
    pub latency_ms: u64,
    /// Adapter invocations made (0 when short-circuited).
    pub attempts: u32,
    /// Whether this provider was a fallback candidate.
    #[serde(default)]
    pub fallback: bool,
    /// Failure reason; `None` on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
}

impl ProviderOutcome {
    /// True if the provider produced results (possibly zero).
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A request-level error entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl From<&SearchError> for ErrorInfo {
    fn from(err: &SearchError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Response bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Time spent handling the request.
    pub query_time_ms: u64,
    /// Providers that returned results.
    pub providers_used: Vec<String>,
    /// Providers that failed.
    pub providers_failed: Vec<String>,
    /// Requested providers left out because they were unhealthy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers_skipped: Vec<String>,
    /// Fusion method applied to the result lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fusion_method: Option<FusionMethod>,
    /// Set when only unhealthy providers were available and were tried anyway.
    pub degraded_service: bool,
    /// Fused results before offset/limit were applied.
    pub total_results: usize,
    /// Cache key for this request, when caching was consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// What the router returns to its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Overall status.
    pub status: ResponseStatus,
    /// Identifier for this request.
    pub request_id: String,
    /// Fused, ranked results.
    pub results: Vec<SearchResult>,
    /// Outcome per provider that was considered.
    pub per_provider_outcomes: BTreeMap<String, ProviderOutcome>,
    /// True if this response was served from the cache.
    pub from_cache: bool,
    /// Bookkeeping.
    pub metadata: ResponseMetadata,
    /// Request-level errors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorInfo>,
}

impl SearchResponse {
    /// Build an `error` response with no results.
    pub fn error(request_id: impl Into<String>, err: &SearchError) -> Self {
        Self {
            status: ResponseStatus::Error,
            request_id: request_id.into(),
            results: Vec::new(),
            per_provider_outcomes: BTreeMap::new(),
            from_cache: false,
            metadata: ResponseMetadata::default(),
            errors: vec![ErrorInfo::from(err)],
        }
    }
}

/// Acknowledgement for an index request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexResponse {
    /// Overall status.
    pub status: ResponseStatus,
    /// Target provider.
    pub provider: String,
    /// Documents the provider accepted.
    pub indexed: usize,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
}
