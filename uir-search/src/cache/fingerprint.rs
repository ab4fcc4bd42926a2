//! Deterministic cache keys for requests.
//!
//! A fingerprint is `uir:v1:` followed by the SHA-256 (hex) of a canonical
//! JSON document:
//!
//! ```text
//! {"kind": ..., "options": {...}, "providers": [sorted, deduplicated], "query": ...}
//! ```
//!
//! Object keys are emitted in sorted order, so neither provider order nor
//! the key order of the caller's JSON affects the result. The `cache`
//! block of the options is excluded; it controls caching rather than
//! results. Weights are re-keyed by provider name so they survive the
//! provider sort.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::types::SearchOptions;

/// Prefix of computed fingerprints. Bump the version when the canonical
/// form changes.
pub const FINGERPRINT_PREFIX: &str = "uir:v1:";

/// Prefix of caller-chosen keys.
pub const CUSTOM_KEY_PREFIX: &str = "uir:custom:";

/// Collapse whitespace runs and trim. Case is preserved, since providers
/// may treat it as significant.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Namespaced key for a caller-supplied cache key.
pub fn custom_key(key: &str) -> String {
    format!("{CUSTOM_KEY_PREFIX}{key}")
}

/// Fingerprint a request.
///
/// `query` is the operation-specific payload: the normalised query text
/// for keyword searches, or a small object for vector and hybrid searches.
pub fn fingerprint(kind: &str, providers: &[String], query: Value, options: &SearchOptions) -> String {
    let mut sorted: Vec<&str> = providers.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let canonical = json!({
        "kind": kind,
        "providers": sorted,
        "query": query,
        "options": canonical_options(providers, options),
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    format!("{FINGERPRINT_PREFIX}{digest:x}")
}

/// The key a request is cached under: the caller's key if given, else the
/// fingerprint.
pub fn cache_key(kind: &str, providers: &[String], query: Value, options: &SearchOptions) -> String {
    match options.cache.key.as_deref() {
        Some(key) if !key.trim().is_empty() => custom_key(key.trim()),
        _ => fingerprint(kind, providers, query, options),
    }
}

fn canonical_options(providers: &[String], options: &SearchOptions) -> Value {
    let mut value = serde_json::to_value(options).unwrap_or_default();
    let Some(map) = value.as_object_mut() else {
        return value;
    };
    map.remove("cache");
    if let Some(weights) = &options.weights {
        let by_provider: Map<String, Value> = providers
            .iter()
            .zip(weights)
            .map(|(p, w)| (p.clone(), Value::from(*w)))
            .collect();
        map.insert("weights".into(), Value::Object(by_provider));
    }
    if let Some(method) = options.fusion_method.as_deref() {
        // Accept any spelling the parser accepts.
        let canonical = method
            .parse::<crate::aggregator::FusionMethod>()
            .map_or_else(|_| method.to_string(), |m| m.name().to_string());
        map.insert("fusion_method".into(), Value::String(canonical));
    }
    value
}
