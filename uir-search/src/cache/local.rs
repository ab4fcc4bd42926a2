//! Process-local cache tier.
//!
//! Backed by [`moka`] with a byte-size ceiling, LRU eviction and a
//! per-entry TTL taken from the entry's own `expires_at`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::Expiry;

use super::CachedEntry;

/// Bytes charged per entry on top of key and payload length.
const ENTRY_OVERHEAD_BYTES: usize = 128;

struct EntryExpiry;

impl Expiry<String, Arc<CachedEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CachedEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.remaining().unwrap_or(Duration::ZERO))
    }
}

/// In-memory LRU tier, bounded by approximate byte size.
#[derive(Clone)]
pub struct LocalCache {
    cache: Cache<String, Arc<CachedEntry>>,
    max_bytes: u64,
}

impl LocalCache {
    /// Create a tier holding at most `max_size_mb` megabytes.
    pub fn new(max_size_mb: u64) -> Self {
        let max_bytes = max_size_mb.saturating_mul(1024 * 1024);
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &String, value: &Arc<CachedEntry>| -> u32 {
                let bytes = key.len() + value.payload.len() + ENTRY_OVERHEAD_BYTES;
                u32::try_from(bytes).unwrap_or(u32::MAX)
            })
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .build();
        Self { cache, max_bytes }
    }

    /// The configured byte ceiling.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Look up a live entry.
    pub async fn get(&self, key: &str) -> Option<Arc<CachedEntry>> {
        let entry = self.cache.get(key).await?;
        if entry.is_expired(Utc::now()) {
            self.cache.invalidate(key).await;
            return None;
        }
        Some(entry)
    }

    /// Store `entry` unless a live entry already exists for its key.
    ///
    /// Returns the entry that is cached afterwards and whether it is the
    /// one passed in. Concurrent inserts for one key are coalesced.
    pub async fn get_or_insert(&self, entry: CachedEntry) -> (Arc<CachedEntry>, bool) {
        let key = entry.key.clone();
        let fresh = Arc::new(entry);
        let cached = self
            .cache
            .entry_by_ref(&key)
            .or_insert_with(async { Arc::clone(&fresh) })
            .await;
        if cached.is_fresh() {
            return (cached.into_value(), true);
        }
        let existing = cached.into_value();
        if existing.is_expired(Utc::now()) {
            self.cache.insert(key, Arc::clone(&fresh)).await;
            return (fresh, true);
        }
        (existing, false)
    }

    /// Drop one key.
    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Drop every key matching `pattern`. Returns the number of keys
    /// removed.
    pub async fn invalidate_matching(&self, pattern: &glob::Pattern) -> u64 {
        let keys: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.cache.invalidate(key.as_str()).await;
        }
        keys.len() as u64
    }

    /// Approximate entry count and weighted size in bytes.
    pub async fn usage(&self) -> (u64, u64) {
        self.cache.run_pending_tasks().await;
        (self.cache.entry_count(), self.cache.weighted_size())
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("max_bytes", &self.max_bytes)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
