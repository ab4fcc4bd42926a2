//! Two-tier response cache.
//!
//! Lookups go local tier first, then the shared tier; a shared hit is
//! copied into the local tier with whatever TTL it has left. Writes go to
//! both tiers and never replace a live entry.
//!
//! The shared tier is optional and untrusted: every call to it is bounded
//! by a timeout and any failure is logged and treated as a miss. A cache
//! outage only ever lowers the hit rate.

pub mod fingerprint;
pub mod local;
pub mod shared;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::config::EngineConfig;
use crate::error::SearchError;
use crate::spans::{FIELD_CACHE_KEY, SPAN_CACHE_LOOKUP};

pub use fingerprint::{cache_key, custom_key, fingerprint, normalize_query};
pub use local::LocalCache;
pub use shared::{RedisSharedCache, SharedCache};

/// Errors raised inside the cache. They never leave [`CacheManager`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The shared tier could not be reached or refused the command.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// The shared tier did not answer in time.
    #[error("cache timed out after {0}ms")]
    Timeout(u64),

    /// A stored value could not be decoded.
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

impl From<CacheError> for SearchError {
    fn from(err: CacheError) -> Self {
        SearchError::CacheUnavailable(err.to_string())
    }
}

/// One cached response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry {
    /// Fingerprint or custom key.
    pub key: String,
    /// Serialised response.
    pub payload: String,
    /// When the entry was first written.
    pub stored_at: DateTime<Utc>,
    /// When the entry stops being served.
    pub expires_at: DateTime<Utc>,
}

impl CachedEntry {
    /// Build an entry stored now that lives for `ttl`.
    pub fn new(key: impl Into<String>, payload: impl Into<String>, ttl: Duration) -> Self {
        let stored_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            key: key.into(),
            payload: payload.into(),
            stored_at,
            expires_at: stored_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// True once `now` has reached `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, or `None` if already expired.
    pub fn remaining(&self) -> Option<Duration> {
        (self.expires_at - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
    }
}

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    /// The in-process tier.
    Local,
    /// The shared tier.
    Shared,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Hits served by the local tier.
    pub local_hits: u64,
    /// Hits served by the shared tier.
    pub shared_hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries written.
    pub writes: u64,
    /// Shared-tier calls that failed or timed out.
    pub shared_errors: u64,
    /// Entries in the local tier.
    pub local_entries: u64,
    /// Approximate bytes held by the local tier.
    pub local_bytes: u64,
    /// Whether a shared tier is configured.
    pub shared_enabled: bool,
}

#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    shared_errors: AtomicU64,
}

/// Tiered cache in front of the provider pipeline.
pub struct CacheManager {
    local: LocalCache,
    shared: Option<Arc<dyn SharedCache>>,
    shared_timeout: Duration,
    default_ttl: Duration,
    counters: Counters,
}

impl CacheManager {
    /// Create a local-only cache sized and timed from `config`.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            local: LocalCache::new(config.local_cache_max_size_mb),
            shared: None,
            shared_timeout: Duration::from_millis(config.shared_cache_timeout_ms),
            default_ttl: Duration::from_secs(config.cache_ttl_seconds),
            counters: Counters::default(),
        }
    }

    /// Add a shared tier.
    #[must_use]
    pub fn with_shared(mut self, shared: Arc<dyn SharedCache>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// TTL applied when a request does not set one.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look `key` up in both tiers.
    pub async fn get(&self, key: &str) -> Option<(Arc<CachedEntry>, CacheTier)> {
        let span = tracing::debug_span!(SPAN_CACHE_LOOKUP, { FIELD_CACHE_KEY } = %key);
        self.lookup(key).instrument(span).await
    }

    async fn lookup(&self, key: &str) -> Option<(Arc<CachedEntry>, CacheTier)> {
        if let Some(entry) = self.local.get(key).await {
            self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(tier = "local", "cache hit");
            return Some((entry, CacheTier::Local));
        }

        let Some(shared) = &self.shared else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let raw = match self.bounded(shared.get(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                self.shared_failed(shared.name(), "get", &e);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let entry = match serde_json::from_str::<CachedEntry>(&raw) {
            Ok(entry) if entry.key == key && !entry.is_expired(Utc::now()) => entry,
            Ok(_) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                self.shared_failed(shared.name(), "decode", &CacheError::Corrupt(e.to_string()));
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(tier = "shared", "cache hit, backfilling local tier");
        let (entry, _) = self.local.get_or_insert(entry).await;
        Some((entry, CacheTier::Shared))
    }

    /// Store `payload` under `key` in both tiers unless a live entry exists.
    ///
    /// `ttl` of `None` uses the configured default; a zero TTL stores
    /// nothing.
    pub async fn put(&self, key: &str, payload: String, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return;
        }
        let entry = CachedEntry::new(key, payload, ttl);
        let encoded = match serde_json::to_string(&entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode cache entry");
                return;
            }
        };

        let (_, inserted) = self.local.get_or_insert(entry).await;
        if inserted {
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(shared) = &self.shared {
            match self.bounded(shared.set_if_absent(key, &encoded, ttl)).await {
                Ok(written) => tracing::debug!(written, "shared tier write"),
                Err(e) => self.shared_failed(shared.name(), "set", &e),
            }
        }
    }

    /// Remove keys matching the glob `pattern` from both tiers; `None`
    /// removes everything this engine wrote.
    ///
    /// Returns the number of keys removed from the local tier. A malformed
    /// pattern removes nothing. Shared-tier failures are logged, not
    /// returned.
    pub async fn invalidate(&self, pattern: Option<&str>) -> u64 {
        let pattern = pattern.filter(|p| !p.trim().is_empty()).unwrap_or("uir:*");
        let matcher = match glob::Pattern::new(pattern) {
            Ok(matcher) => matcher,
            Err(e) => {
                tracing::warn!(pattern, error = %e, "invalid invalidation pattern");
                return 0;
            }
        };
        let removed = self.local.invalidate_matching(&matcher).await;
        if let Some(shared) = &self.shared {
            match self.bounded(shared.delete_matching(pattern)).await {
                Ok(n) => tracing::debug!(removed = n, "shared tier invalidated"),
                Err(e) => self.shared_failed(shared.name(), "invalidate", &e),
            }
        }
        tracing::info!(pattern, removed, "cache invalidated");
        removed
    }

    /// Snapshot of the counters.
    pub async fn stats(&self) -> CacheStats {
        let (local_entries, local_bytes) = self.local.usage().await;
        CacheStats {
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            shared_errors: self.counters.shared_errors.load(Ordering::Relaxed),
            local_entries,
            local_bytes,
            shared_enabled: self.shared.is_some(),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.shared_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(
                u64::try_from(self.shared_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }

    fn shared_failed(&self, tier: &str, op: &str, err: &CacheError) {
        self.counters.shared_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(tier, op, error = %err, "shared cache degraded, continuing with local tier");
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("local", &self.local)
            .field("shared", &self.shared.as_ref().map(|s| s.name().to_string()))
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}
