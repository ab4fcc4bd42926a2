//! Per-provider request throttling.
//!
//! Each rate-limited provider owns a token bucket holding up to one
//! second's worth of requests. Tokens refill continuously; a call that
//! finds the bucket empty is rejected locally and never reaches the
//! provider.

use std::time::{Duration, Instant};

use crate::error::ProviderError;

/// Continuous-refill token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket allowing `requests_per_second`.
    #[must_use]
    pub fn new(requests_per_second: u32, now: Instant) -> Self {
        let rate = f64::from(requests_per_second.max(1));
        Self {
            capacity: rate,
            tokens: rate,
            refill_per_sec: rate,
            last_refill: now,
        }
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), ProviderError> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let wait = Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec);
        Err(ProviderError::RateLimited(format!(
            "local limit of {}/s reached; retry in {}ms",
            self.capacity,
            wait.as_millis().max(1)
        )))
    }

    /// Whole tokens currently available.
    #[must_use]
    pub fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens.floor() as u32
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}
