//! Structured tracing span names and field keys.
//!
//! Spans follow the hierarchy:
//!
//! ```text
//! uir.router.request
//!   ├─> uir.cache.lookup
//!   └─> uir.provider.call (one per provider, concurrent)
//! ```
//!
//! Query text is only ever recorded at trace level.

/// Root span for one routed request.
pub const SPAN_ROUTER_REQUEST: &str = "uir.router.request";

/// Span for one provider's share of a request, retries included.
pub const SPAN_PROVIDER_CALL: &str = "uir.provider.call";

/// Span for a tiered cache lookup.
pub const SPAN_CACHE_LOOKUP: &str = "uir.cache.lookup";

/// Request identifier field.
pub const FIELD_REQUEST_ID: &str = "request_id";

/// Operation field (`search`, `vector_search`, `hybrid_search`, `index`).
pub const FIELD_OPERATION: &str = "operation";

/// Provider name field.
pub const FIELD_PROVIDER: &str = "provider";

/// Cache key field.
pub const FIELD_CACHE_KEY: &str = "cache_key";
