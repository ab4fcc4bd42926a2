//! Engine and provider configuration with sensible defaults.
//!
//! [`EngineConfig`] holds the global knobs (timeouts, cache sizing, fusion
//! defaults, selection strategy). [`ProviderPolicy`] holds the per-provider
//! resilience settings consumed by the circuit breaker, health tracker,
//! rate limiter and retry loop.

use serde::{Deserialize, Serialize};

use crate::aggregator::FusionMethod;
use crate::error::SearchError;
use crate::types::Capability;

/// How ties within one health tier are broken by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// Keep the caller's order within a tier.
    #[default]
    HealthOnly,
    /// Rotate the tier's members on every selection.
    RoundRobin,
    /// Prefer higher `weight / latency`.
    InverseLatency,
}

/// Global engine configuration.
///
/// Use [`Default::default()`] for sensible defaults, or deserialise from a
/// config file; missing fields fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Overall request timeout when the request does not set one.
    pub default_timeout_ms: u64,
    /// TTL for cached responses when the request does not set one.
    pub cache_ttl_seconds: u64,
    /// Memory ceiling for the local cache tier.
    pub local_cache_max_size_mb: u64,
    /// Fusion method used when the request does not name one.
    pub fusion_default_method: FusionMethod,
    /// RRF constant `k`.
    pub rrf_k: f64,
    /// Maximum providers queried concurrently for one request.
    pub max_fan_out: usize,
    /// Tie-breaking inside a health tier.
    pub load_balancing: LoadBalancing,
    /// EMA latency above which a provider is degraded.
    pub latency_degraded_ms: f64,
    /// Number of recent calls used for the success rate.
    pub health_window: usize,
    /// Smoothing factor for the latency EMA, in `(0, 1]`.
    pub latency_ema_alpha: f64,
    /// Interval between background health checks. 0 disables them.
    pub health_check_interval_secs: u64,
    /// Upper bound on any single shared-cache operation.
    pub shared_cache_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            cache_ttl_seconds: 3_600,
            local_cache_max_size_mb: 64,
            fusion_default_method: FusionMethod::ReciprocalRank,
            rrf_k: 60.0,
            max_fan_out: 8,
            load_balancing: LoadBalancing::HealthOnly,
            latency_degraded_ms: 2_000.0,
            health_window: 50,
            latency_ema_alpha: 0.3,
            health_check_interval_secs: 60,
            shared_cache_timeout_ms: 250,
        }
    }
}

impl EngineConfig {
    /// Validates this configuration, returning an error if any field is invalid.
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.default_timeout_ms == 0 {
            return Err(SearchError::Config(
                "default_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.max_fan_out == 0 {
            return Err(SearchError::Config(
                "max_fan_out must be greater than 0".into(),
            ));
        }
        if self.health_window == 0 {
            return Err(SearchError::Config(
                "health_window must be greater than 0".into(),
            ));
        }
        if !(self.latency_ema_alpha > 0.0 && self.latency_ema_alpha <= 1.0) {
            return Err(SearchError::Config(
                "latency_ema_alpha must be in (0, 1]".into(),
            ));
        }
        if !(self.rrf_k.is_finite() && self.rrf_k >= 0.0) {
            return Err(SearchError::Config(
                "rrf_k must be a non-negative number".into(),
            ));
        }
        Ok(())
    }
}

/// Per-provider resilience policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderPolicy {
    /// Failure ratio over the window above which the circuit opens.
    pub failure_threshold: f64,
    /// Consecutive failures that open the circuit regardless of the ratio.
    ///
    /// Inclusive: the failure that brings the run to this count opens the
    /// circuit, so the tolerated ceiling is one less. Must be at least 1.
    pub consecutive_failure_limit: u32,
    /// Seconds the circuit stays open before probing.
    pub recovery_timeout_secs: u64,
    /// Size of the sliding window of recent calls.
    pub min_requests: u32,
    /// Probe successes needed to close a half-open circuit.
    pub half_open_success_threshold: u32,
    /// Concurrent probes allowed while half-open.
    pub half_open_max_probes: u32,
    /// Timeout for one adapter invocation.
    pub timeout_ms: u64,
    /// Requests per second; `None` means unlimited.
    pub rate_limit: Option<u32>,
    /// Relative weight for inverse-latency balancing.
    pub weight: f64,
    /// Extra attempts after a retryable failure.
    pub retry_attempts: u32,
    /// Base backoff between attempts; doubles each retry.
    pub retry_backoff_ms: u64,
    /// Overrides the capabilities the adapter declares.
    pub capabilities: Option<Vec<Capability>>,
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            consecutive_failure_limit: 5,
            recovery_timeout_secs: 60,
            min_requests: 10,
            half_open_success_threshold: 2,
            half_open_max_probes: 1,
            timeout_ms: 5_000,
            rate_limit: None,
            weight: 1.0,
            retry_attempts: 0,
            retry_backoff_ms: 100,
            capabilities: None,
        }
    }
}

impl ProviderPolicy {
    /// Validates this policy.
    pub fn validate(&self, provider: &str) -> Result<(), SearchError> {
        if !(self.failure_threshold > 0.0 && self.failure_threshold <= 1.0) {
            return Err(SearchError::Config(format!(
                "{provider}: failure_threshold must be in (0, 1]"
            )));
        }
        if self.min_requests == 0 {
            return Err(SearchError::Config(format!(
                "{provider}: min_requests must be greater than 0"
            )));
        }
        if self.consecutive_failure_limit == 0 {
            return Err(SearchError::Config(format!(
                "{provider}: consecutive_failure_limit must be greater than 0"
            )));
        }
        if self.half_open_success_threshold == 0 || self.half_open_max_probes == 0 {
            return Err(SearchError::Config(format!(
                "{provider}: half-open thresholds must be greater than 0"
            )));
        }
        if self.timeout_ms == 0 {
            return Err(SearchError::Config(format!(
                "{provider}: timeout_ms must be greater than 0"
            )));
        }
        if self.rate_limit == Some(0) {
            return Err(SearchError::Config(format!(
                "{provider}: rate_limit must be greater than 0 when set"
            )));
        }
        if !(self.weight.is_finite() && self.weight > 0.0) {
            return Err(SearchError::Config(format!(
                "{provider}: weight must be positive"
            )));
        }
        Ok(())
    }
}
