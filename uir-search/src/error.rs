//! Error types for the uir-search crate.
//!
//! Two layers of error exist:
//!
//! - [`ProviderError`] describes why a single provider call did not produce
//!   results. It is captured per provider and never aborts sibling calls.
//! - [`SearchError`] describes request-level failures that the router turns
//!   into an `error` response.
//!
//! Both carry stable codes (SCREAMING_SNAKE_CASE) accessible via `code()`.
//! Codes are part of the response contract and do not change.

use serde::{Deserialize, Serialize};

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// A provider call exceeded its timeout or the request deadline.
    pub const PROVIDER_TIMEOUT: &str = "PROVIDER_TIMEOUT";
    /// The provider (or our local bucket for it) is throttling requests.
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    /// The provider returned an error of its own.
    pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
    /// The provider rejected the request as malformed.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// The provider's circuit is open; no call was made.
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    /// The caller may not use this provider.
    pub const ACCESS_DENIED: &str = "ACCESS_DENIED";
    /// The provider does not support the requested operation.
    pub const UNSUPPORTED: &str = "UNSUPPORTED";

    /// Every selected provider failed.
    pub const ALL_PROVIDERS_FAILED: &str = "ALL_PROVIDERS_FAILED";
    /// The request deadline passed before any provider responded.
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
    /// The requested fusion method is unknown.
    pub const INVALID_FUSION_METHOD: &str = "INVALID_FUSION_METHOD";
    /// A cache tier could not be reached.
    pub const CACHE_UNAVAILABLE: &str = "CACHE_UNAVAILABLE";
    /// The request failed validation.
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    /// Invalid engine or provider configuration.
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";
    /// The embedding collaborator failed.
    pub const EMBEDDING_FAILED: &str = "EMBEDDING_FAILED";
    /// No provider could be selected for the request.
    pub const NO_PROVIDERS: &str = "NO_PROVIDERS";
}

/// Why a single provider call produced no results.
///
/// Serialised as `{"code": "...", "message": "..."}` inside per-provider
/// outcomes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "message")]
pub enum ProviderError {
    /// The call exceeded its own timeout or the request deadline.
    #[error("provider timed out: {0}")]
    #[serde(rename = "PROVIDER_TIMEOUT")]
    Timeout(String),

    /// The provider is throttling, or its local token bucket is empty.
    #[error("provider rate limited: {0}")]
    #[serde(rename = "RATE_LIMITED")]
    RateLimited(String),

    /// The provider answered with an error.
    #[error("upstream error: {0}")]
    #[serde(rename = "UPSTREAM_ERROR")]
    Upstream(String),

    /// The provider rejected the request.
    #[error("invalid request: {0}")]
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest(String),

    /// Short-circuited by the provider's circuit breaker.
    #[error("circuit open: {0}")]
    #[serde(rename = "CIRCUIT_OPEN")]
    CircuitOpen(String),

    /// The access policy refused this caller.
    #[error("access denied: {0}")]
    #[serde(rename = "ACCESS_DENIED")]
    AccessDenied(String),

    /// The provider lacks the capability the operation needs.
    #[error("unsupported operation: {0}")]
    #[serde(rename = "UNSUPPORTED")]
    Unsupported(String),
}

impl ProviderError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => error_codes::PROVIDER_TIMEOUT,
            Self::RateLimited(_) => error_codes::RATE_LIMITED,
            Self::Upstream(_) => error_codes::UPSTREAM_ERROR,
            Self::InvalidRequest(_) => error_codes::INVALID_REQUEST,
            Self::CircuitOpen(_) => error_codes::CIRCUIT_OPEN,
            Self::AccessDenied(_) => error_codes::ACCESS_DENIED,
            Self::Unsupported(_) => error_codes::UNSUPPORTED,
        }
    }

    /// Returns the inner message without any prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Timeout(m)
            | Self::RateLimited(m)
            | Self::Upstream(m)
            | Self::InvalidRequest(m)
            | Self::CircuitOpen(m)
            | Self::AccessDenied(m)
            | Self::Unsupported(m) => m,
        }
    }

    /// Returns true if the failure is transient and the call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited(_) | Self::Upstream(_)
        )
    }

    /// Returns true if this outcome should count against the provider's
    /// health and circuit.
    ///
    /// Request-shape problems are the caller's fault, not the provider's.
    pub fn counts_as_failure(&self) -> bool {
        self.is_retryable()
    }
}

/// Request-level errors surfaced by the router.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SearchError {
    /// Every selected provider failed.
    #[error("all providers failed: {0}")]
    AllProvidersFailed(String),

    /// The request deadline passed before any provider responded.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Unknown fusion method name; rejected before any provider call.
    #[error("invalid fusion method: {0}")]
    InvalidFusionMethod(String),

    /// A cache tier is unreachable. Logged, never returned to callers.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The request is malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid engine or provider configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The embedding collaborator failed or timed out.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// No requested provider is registered, capable and permitted.
    #[error("no providers available: {0}")]
    NoProviders(String),
}

impl SearchError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AllProvidersFailed(_) => error_codes::ALL_PROVIDERS_FAILED,
            Self::DeadlineExceeded(_) => error_codes::DEADLINE_EXCEEDED,
            Self::InvalidFusionMethod(_) => error_codes::INVALID_FUSION_METHOD,
            Self::CacheUnavailable(_) => error_codes::CACHE_UNAVAILABLE,
            Self::Validation(_) => error_codes::VALIDATION_FAILED,
            Self::Config(_) => error_codes::CONFIG_INVALID,
            Self::Embedding(_) => error_codes::EMBEDDING_FAILED,
            Self::NoProviders(_) => error_codes::NO_PROVIDERS,
        }
    }
}

/// Convenience type alias for uir-search results.
pub type Result<T> = std::result::Result<T, SearchError>;
