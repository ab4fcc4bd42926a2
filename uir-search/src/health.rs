//! Rolling health view of each provider.
//!
//! A [`HealthTracker`] folds every call outcome into a bounded window of
//! successes plus an exponential moving average of latency, and derives a
//! [`HealthState`] from the two together with the circuit state.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitState;
use crate::config::EngineConfig;

/// Success rate below which a provider is unhealthy.
const UNHEALTHY_RATE: f64 = 0.80;
/// Success rate below which a provider is degraded.
const DEGRADED_RATE: f64 = 0.95;

/// Coarse health classification used for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Preferred for selection.
    Healthy,
    /// Usable, ranked after healthy providers.
    Degraded,
    /// Only used when nothing better is available.
    Unhealthy,
}

/// Inputs to health derivation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    /// Number of recent calls considered for the success rate.
    pub window: usize,
    /// EMA latency above which a provider is degraded.
    pub latency_degraded_ms: f64,
    /// EMA smoothing factor.
    pub ema_alpha: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for HealthThresholds {
    fn from(config: &EngineConfig) -> Self {
        Self {
            window: config.health_window.max(1),
            latency_degraded_ms: config.latency_degraded_ms,
            ema_alpha: config.latency_ema_alpha,
        }
    }
}

/// Serializable health snapshot for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    /// Derived state.
    pub state: HealthState,
    /// Successes over the window; `1.0` with no samples.
    pub success_rate: f64,
    /// Latency EMA in milliseconds, `0.0` before the first sample.
    pub latency_ema_ms: f64,
    /// Time of the most recent recorded outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Outcomes recorded since registration.
    pub total_calls: u64,
}

/// Per-provider health bookkeeping.
#[derive(Debug)]
pub struct HealthTracker {
    thresholds: HealthThresholds,
    window: VecDeque<bool>,
    latency_ema_ms: Option<f64>,
    last_checked_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    total_calls: u64,
    state: HealthState,
}

impl HealthTracker {
    /// Create a tracker for a provider with no history. It starts healthy.
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            window: VecDeque::with_capacity(thresholds.window),
            thresholds,
            latency_ema_ms: None,
            last_checked_at: None,
            consecutive_failures: 0,
            total_calls: 0,
            state: HealthState::Healthy,
        }
    }

    /// Fold one call outcome into the rolling view and re-derive the state.
    pub fn record(&mut self, ok: bool, latency_ms: f64, circuit: CircuitState) {
        if self.window.len() >= self.thresholds.window {
            self.window.pop_front();
        }
        self.window.push_back(ok);

        let alpha = self.thresholds.ema_alpha;
        let latency_ms = latency_ms.max(0.0);
        self.latency_ema_ms = Some(match self.latency_ema_ms {
            Some(prev) => alpha * latency_ms + (1.0 - alpha) * prev,
            None => latency_ms,
        });

        if ok {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        self.total_calls += 1;
        self.last_checked_at = Some(Utc::now());
        self.refresh(circuit);
    }

    /// Re-derive the state after a circuit transition with no new sample.
    pub fn refresh(&mut self, circuit: CircuitState) {
        let next = self.derive(circuit);
        if next != self.state {
            tracing::debug!(from = ?self.state, to = ?next, "provider health changed");
        }
        self.state = next;
    }

    /// Current state.
    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Successes over the window; `1.0` with no samples.
    pub fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|ok| **ok).count();
        ok as f64 / self.window.len() as f64
    }

    /// Latency EMA, `0.0` before the first sample.
    pub fn latency_ema_ms(&self) -> f64 {
        self.latency_ema_ms.unwrap_or(0.0)
    }

    /// Serializable snapshot.
    pub fn snapshot(&self) -> ProviderHealth {
        ProviderHealth {
            state: self.state,
            success_rate: self.success_rate(),
            latency_ema_ms: self.latency_ema_ms(),
            last_checked_at: self.last_checked_at,
            consecutive_failures: self.consecutive_failures,
            total_calls: self.total_calls,
        }
    }

    fn derive(&self, circuit: CircuitState) -> HealthState {
        let rate = self.success_rate();
        if circuit == CircuitState::Open || rate < UNHEALTHY_RATE {
            HealthState::Unhealthy
        } else if rate < DEGRADED_RATE || self.latency_ema_ms() > self.thresholds.latency_degraded_ms
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }
}
