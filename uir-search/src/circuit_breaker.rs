//! Per-provider circuit breaker.
//!
//! Tracks the outcome of recent calls to one provider and stops calling it
//! once failures dominate. After a recovery timeout, a tripped circuit
//! enters a half-open state where a limited number of probe calls decide
//! whether to restore or re-trip it.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐ ratio/ceiling ┌────────┐  recovery   ┌──────────┐
//! │ Closed ├──────────────►│  Open  ├────────────►│ HalfOpen │
//! └───▲────┘               └───▲────┘             └────┬─────┘
//!     │                        │   any failure         │
//!     │                        └───────────────────────┤
//!     │         N probe successes                      │
//!     └────────────────────────────────────────────────┘
//! ```
//!
//! Every method takes the current [`Instant`] explicitly. Callers own the
//! breaker behind their own lock, so transition checks and counter updates
//! happen in one critical section per provider.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::ProviderPolicy;
use crate::error::ProviderError;

/// Circuit breaker state for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are short-circuited until the recovery timeout elapses.
    Open,
    /// A limited number of probe calls are allowed through.
    HalfOpen,
}

/// Configuration for circuit breaker behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure ratio over a full window above which the circuit opens.
    pub failure_threshold: f64,
    /// Consecutive failures that open the circuit on their own. The
    /// failure reaching this count trips it.
    pub consecutive_failure_limit: u32,
    /// Number of recent calls kept in the sliding window.
    pub window_size: u32,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
    /// Probe successes required to close.
    pub half_open_success_threshold: u32,
    /// Probes allowed in flight while half-open.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&ProviderPolicy::default())
    }
}

impl From<&ProviderPolicy> for CircuitBreakerConfig {
    fn from(policy: &ProviderPolicy) -> Self {
        Self {
            failure_threshold: policy.failure_threshold,
            consecutive_failure_limit: policy.consecutive_failure_limit,
            window_size: policy.min_requests.max(1),
            recovery_timeout: Duration::from_secs(policy.recovery_timeout_secs),
            half_open_success_threshold: policy.half_open_success_threshold.max(1),
            half_open_max_probes: policy.half_open_max_probes.max(1),
        }
    }
}

/// Point-in-time view of a breaker, for stats and health derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures within the sliding window.
    pub failure_count: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Probe successes since the circuit went half-open.
    pub success_count_in_half_open: u32,
    /// How long ago the circuit last opened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_ms_ago: Option<u64>,
    /// Number of times this circuit has tripped.
    pub trips: u64,
}

/// Failure-isolation state machine for one provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    /// Recent outcomes, `true` for failure. Bounded by `window_size`.
    window: VecDeque<bool>,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    success_count_in_half_open: u32,
    probes_in_flight: u32,
    trips: u64,
}

impl CircuitBreaker {
    /// Create a closed breaker for `provider`.
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let window = VecDeque::with_capacity(config.window_size as usize);
        Self {
            provider: provider.into(),
            config,
            state: CircuitState::Closed,
            window,
            consecutive_failures: 0,
            opened_at: None,
            success_count_in_half_open: 0,
            probes_in_flight: 0,
            trips: 0,
        }
    }

    /// Current state, without applying any time-based transition.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures within the sliding window.
    pub fn failure_count(&self) -> u32 {
        self.window.iter().filter(|failed| **failed).count() as u32
    }

    /// True if the circuit is open and the recovery timeout has not elapsed.
    ///
    /// A circuit whose timeout has elapsed is not "open" for selection
    /// purposes: the next call will be admitted as a probe.
    pub fn is_open(&self, now: Instant) -> bool {
        self.state == CircuitState::Open && !self.recovery_elapsed(now)
    }

    /// Ask permission to call the provider.
    ///
    /// - [`CircuitState::Closed`]: always admitted.
    /// - [`CircuitState::Open`]: rejected until the recovery timeout has
    ///   elapsed, then transitions to [`CircuitState::HalfOpen`] and admits a probe.
    /// - [`CircuitState::HalfOpen`]: admitted while fewer than
    ///   `half_open_max_probes` probes are in flight.
    ///
    /// Every admitted call must be followed by exactly one of
    /// [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or
    /// [`release`](Self::release).
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), ProviderError> {
        if self.state == CircuitState::Open {
            if !self.recovery_elapsed(now) {
                let remaining = self.remaining_open(now);
                return Err(ProviderError::CircuitOpen(format!(
                    "{} is failing; next probe in {}ms",
                    self.provider,
                    remaining.as_millis()
                )));
            }
            self.transition_to_half_open();
        }

        if self.state == CircuitState::Closed {
            return Ok(());
        }
        if self.probes_in_flight < self.config.half_open_max_probes {
            self.probes_in_flight += 1;
            Ok(())
        } else {
            Err(ProviderError::CircuitOpen(format!(
                "{} is half-open and its probe budget is in use",
                self.provider
            )))
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self, _now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.push_outcome(false);
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                self.success_count_in_half_open += 1;
                if self.success_count_in_half_open >= self.config.half_open_success_threshold {
                    self.close();
                }
            }
            // A call admitted before the trip finished late; the open window stands.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.push_outcome(true);
                self.consecutive_failures += 1;
                if self.should_trip() {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures += 1;
                self.open(now);
            }
            CircuitState::Open => {
                self.consecutive_failures += 1;
            }
        }
    }

    /// Return an admitted call's permit without recording an outcome.
    ///
    /// Used when the call ended in a way that says nothing about the
    /// provider's health (for example, the request itself was invalid).
    pub fn release(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
        }
    }

    /// Reset to a fresh closed circuit.
    pub fn reset(&mut self) {
        self.close();
    }

    /// Point-in-time view of this breaker.
    pub fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count(),
            consecutive_failures: self.consecutive_failures,
            success_count_in_half_open: self.success_count_in_half_open,
            opened_ms_ago: self
                .opened_at
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            trips: self.trips,
        }
    }

    fn push_outcome(&mut self, failed: bool) {
        if self.window.len() >= self.config.window_size as usize {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    fn should_trip(&self) -> bool {
        if self.consecutive_failures >= self.config.consecutive_failure_limit {
            return true;
        }
        let size = self.window.len();
        if size < self.config.window_size as usize {
            return false;
        }
        let ratio = f64::from(self.failure_count()) / size as f64;
        ratio > self.config.failure_threshold
    }

    fn recovery_elapsed(&self, now: Instant) -> bool {
        self.opened_at.map_or(true, |t| {
            now.saturating_duration_since(t) >= self.config.recovery_timeout
        })
    }

    fn remaining_open(&self, now: Instant) -> Duration {
        self.opened_at.map_or(Duration::ZERO, |t| {
            self.config
                .recovery_timeout
                .saturating_sub(now.saturating_duration_since(t))
        })
    }

    fn open(&mut self, now: Instant) {
        let from = self.state;
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.success_count_in_half_open = 0;
        self.probes_in_flight = 0;
        self.trips += 1;
        tracing::warn!(
            provider = %self.provider,
            ?from,
            failures = self.failure_count(),
            consecutive = self.consecutive_failures,
            "circuit opened"
        );
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.success_count_in_half_open = 0;
        self.probes_in_flight = 0;
        tracing::info!(provider = %self.provider, "circuit half-open; probing");
    }

    fn close(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!(provider = %self.provider, "circuit closed");
        }
        self.state = CircuitState::Closed;
        self.window.clear();
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.success_count_in_half_open = 0;
        self.probes_in_flight = 0;
    }
}
