//! Shared cache tier.
//!
//! The [`SharedCache`] trait is the seam; [`RedisSharedCache`] is the
//! production implementation. Every error is a [`CacheError`] so the
//! manager can downgrade it to a miss.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::OnceCell;

use super::CacheError;

/// Keys scanned per `SCAN` round trip.
const SCAN_BATCH: usize = 200;

/// A cache shared between processes.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` for `ttl` unless the key already exists. Returns
    /// `true` if the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CacheError>;

    /// Delete every key matching `pattern` (`*` wildcards).
    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError>;
}

/// Redis-backed shared tier.
///
/// The connection is established lazily on first use and then reused; the
/// connection manager reconnects on its own after the server comes back.
pub struct RedisSharedCache {
    client: Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisSharedCache {
    /// Create a client for `url` (e.g. `redis://localhost:6379`).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the URL is malformed. No
    /// connection is attempted here.
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)
            .map_err(|e| CacheError::Unavailable(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.client
                    .get_connection_manager()
                    .await
                    .map_err(|e| CacheError::Unavailable(format!("redis connect failed: {e}")))
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| CacheError::Unavailable(format!("redis GET failed: {e}")))?;
        Ok(value)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let written: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(format!("redis SET failed: {e}")))?;
        Ok(written.is_some())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Unavailable(format!("redis SCAN failed: {e}")))?;
            if !keys.is_empty() {
                let count: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| CacheError::Unavailable(format!("redis DEL failed: {e}")))?;
                removed += count;
            }
            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}

impl std::fmt::Debug for RedisSharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSharedCache")
            .field("connected", &self.conn.initialized())
            .finish()
    }
}
