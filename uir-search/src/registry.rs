//! Copy-on-write provider registry.
//!
//! Each registered provider owns one [`ProviderEntry`] whose circuit
//! breaker, health tracker and rate limiter are guarded by their own
//! mutexes. Concurrent calls to one provider serialize on that provider's
//! locks only; different providers never contend.
//!
//! The set of entries is published as an immutable [`RegistrySnapshot`].
//! Requests take a snapshot when they start, so registering or removing a
//! provider never disturbs a request already in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
use crate::clock::Clock;
use crate::config::ProviderPolicy;
use crate::error::{ProviderError, SearchError};
use crate::health::{HealthState, HealthThresholds, HealthTracker, ProviderHealth};
use crate::provider::ProviderAdapter;
use crate::rate_limit::TokenBucket;
use crate::types::Capability;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Observability view of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    /// Provider name.
    pub name: String,
    /// Effective capabilities.
    pub capabilities: Vec<Capability>,
    /// Circuit breaker view.
    pub circuit: CircuitSnapshot,
    /// Health view.
    pub health: ProviderHealth,
    /// Adapter invocations.
    pub calls: u64,
    /// Adapter invocations that failed.
    pub failures: u64,
    /// Calls rejected by the circuit or the local rate limit.
    pub rejected: u64,
}

/// Runtime state for one registered provider.
pub struct ProviderEntry {
    name: String,
    adapter: Arc<dyn ProviderAdapter>,
    policy: ProviderPolicy,
    capabilities: Vec<Capability>,
    breaker: Mutex<CircuitBreaker>,
    health: Mutex<HealthTracker>,
    limiter: Option<Mutex<TokenBucket>>,
    calls: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl ProviderEntry {
    fn new(
        adapter: Arc<dyn ProviderAdapter>,
        policy: ProviderPolicy,
        thresholds: HealthThresholds,
        now: Instant,
    ) -> Self {
        let name = adapter.name().to_string();
        let capabilities = policy
            .capabilities
            .clone()
            .unwrap_or_else(|| adapter.capabilities());
        let breaker = CircuitBreaker::new(name.clone(), CircuitBreakerConfig::from(&policy));
        let limiter = policy
            .rate_limit
            .map(|rps| Mutex::new(TokenBucket::new(rps, now)));
        Self {
            name,
            adapter,
            capabilities,
            breaker: Mutex::new(breaker),
            health: Mutex::new(HealthTracker::new(thresholds)),
            limiter,
            policy,
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Provider name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backend adapter.
    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    /// Resilience policy.
    pub fn policy(&self) -> &ProviderPolicy {
        &self.policy
    }

    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.policy.timeout_ms)
    }

    /// Whether this provider can serve `capability`.
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Ask the rate limiter and then the circuit breaker for permission.
    ///
    /// A successful admission must be followed by one `record_*` call or
    /// [`release`](Self::release).
    pub fn admit(&self, now: Instant) -> Result<(), ProviderError> {
        if let Some(limiter) = &self.limiter {
            if let Err(err) = lock(limiter).try_acquire(now) {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        }
        let admitted = lock(&self.breaker).try_acquire(now);
        if admitted.is_err() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Return an admission without recording an outcome.
    pub fn release(&self) {
        lock(&self.breaker).release();
    }

    /// Record a successful adapter call.
    pub fn record_success(&self, now: Instant, latency: Duration) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let circuit = {
            let mut breaker = lock(&self.breaker);
            breaker.record_success(now);
            breaker.state()
        };
        lock(&self.health).record(true, latency.as_secs_f64() * 1_000.0, circuit);
    }

    /// Record a failed adapter call.
    ///
    /// Errors that say nothing about the provider's health (invalid or
    /// unsupported requests) release the admission instead of counting
    /// against the circuit.
    pub fn record_failure(&self, now: Instant, latency: Duration, err: &ProviderError) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !err.counts_as_failure() {
            self.release();
            return;
        }
        self.failures.fetch_add(1, Ordering::Relaxed);
        let circuit = {
            let mut breaker = lock(&self.breaker);
            breaker.record_failure(now);
            breaker.state()
        };
        lock(&self.health).record(false, latency.as_secs_f64() * 1_000.0, circuit);
    }

    /// Record an idle heartbeat. Only health is updated.
    pub fn record_heartbeat(&self, ok: bool, latency: Duration) {
        let circuit = lock(&self.breaker).state();
        lock(&self.health).record(ok, latency.as_secs_f64() * 1_000.0, circuit);
    }

    /// True if the circuit is open and still inside its recovery timeout.
    pub fn is_circuit_open(&self, now: Instant) -> bool {
        lock(&self.breaker).is_open(now)
    }

    /// Health as seen by the selector at `now`.
    ///
    /// An open circuit whose recovery timeout has elapsed no longer forces
    /// the provider to the unhealthy tier, so it can receive a probe.
    pub fn health_state(&self, now: Instant) -> HealthState {
        let circuit = {
            let breaker = lock(&self.breaker);
            match breaker.state() {
                CircuitState::Open if !breaker.is_open(now) => CircuitState::HalfOpen,
                state => state,
            }
        };
        let mut health = lock(&self.health);
        health.refresh(circuit);
        health.state()
    }

    /// Latency EMA in milliseconds.
    pub fn latency_ema_ms(&self) -> f64 {
        lock(&self.health).latency_ema_ms()
    }

    /// Reset the circuit breaker to closed.
    pub fn reset_circuit(&self) {
        let circuit = {
            let mut breaker = lock(&self.breaker);
            breaker.reset();
            breaker.state()
        };
        lock(&self.health).refresh(circuit);
    }

    /// Observability snapshot.
    pub fn stats(&self, now: Instant) -> ProviderStats {
        let circuit = lock(&self.breaker).snapshot(now);
        let health = lock(&self.health).snapshot();
        ProviderStats {
            name: self.name.clone(),
            capabilities: self.capabilities.clone(),
            circuit,
            health,
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of the registered providers.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    entries: Vec<Arc<ProviderEntry>>,
    by_name: HashMap<String, usize>,
    version: u64,
}

impl RegistrySnapshot {
    fn from_entries(entries: Vec<Arc<ProviderEntry>>, version: u64) -> Self {
        let by_name = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        Self {
            entries,
            by_name,
            version,
        }
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<&Arc<ProviderEntry>> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// All entries in registration order.
    pub fn entries(&self) -> &[Arc<ProviderEntry>] {
        &self.entries
    }

    /// Monotonic version, bumped on every change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of providers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no providers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registry of providers, published as copy-on-write snapshots.
pub struct ProviderRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    thresholds: HealthThresholds,
    clock: Arc<dyn Clock>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new(thresholds: HealthThresholds, clock: Arc<dyn Clock>) -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
            thresholds,
            clock,
        }
    }

    /// The clock used for circuit and rate-limit bookkeeping.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register a provider, replacing any provider with the same name.
    ///
    /// A replaced provider starts over with a closed circuit and no history.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Config`] if the policy is invalid or the
    /// adapter has an empty name.
    pub fn register(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        policy: ProviderPolicy,
    ) -> Result<(), SearchError> {
        let name = adapter.name().to_string();
        if name.trim().is_empty() {
            return Err(SearchError::Config("provider name must not be empty".into()));
        }
        policy.validate(&name)?;
        let entry = Arc::new(ProviderEntry::new(
            adapter,
            policy,
            self.thresholds,
            self.clock.now(),
        ));

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = current
            .entries
            .iter()
            .filter(|e| e.name != name)
            .cloned()
            .collect();
        entries.push(entry);
        let version = current.version + 1;
        *current = Arc::new(RegistrySnapshot::from_entries(entries, version));
        tracing::info!(provider = %name, version, "provider registered");
        Ok(())
    }

    /// Remove a provider. Returns false if it was not registered.
    pub fn deregister(&self, name: &str) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.get(name).is_none() {
            return false;
        }
        let entries: Vec<_> = current
            .entries
            .iter()
            .filter(|e| e.name != name)
            .cloned()
            .collect();
        let version = current.version + 1;
        *current = Arc::new(RegistrySnapshot::from_entries(entries, version));
        tracing::info!(provider = %name, version, "provider deregistered");
        true
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Names of all registered providers, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .entries
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{SearchOptions, SearchResult};
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl ProviderAdapter for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn search(
            &self,
            _query: &str,
            _options: &SearchOptions,
            _deadline: tokio::time::Instant,
        ) -> Result<Vec<SearchResult>, ProviderError> {
            Ok(vec![])
        }
    }

    fn registry() -> (ProviderRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let registry = ProviderRegistry::new(HealthThresholds::default(), clock.clone());
        (registry, clock)
    }

    #[test]
    fn register_and_lookup() {
        let (registry, _) = registry();
        registry
            .register(Arc::new(Named("a")), ProviderPolicy::default())
            .expect("register");
        registry
            .register(Arc::new(Named("b")), ProviderPolicy::default())
            .expect("register");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.get("a").is_some());
        assert!(snapshot.get("c").is_none());
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_changes() {
        let (registry, _) = registry();
        registry
            .register(Arc::new(Named("a")), ProviderPolicy::default())
            .expect("register");
        let before = registry.snapshot();
        assert!(registry.deregister("a"));
        assert!(before.get("a").is_some());
        assert!(registry.snapshot().get("a").is_none());
        assert!(registry.snapshot().version() > before.version());
    }

    #[test]
    fn deregister_unknown_returns_false() {
        let (registry, _) = registry();
        assert!(!registry.deregister("ghost"));
    }

    #[test]
    fn invalid_policy_rejected() {
        let (registry, _) = registry();
        let policy = ProviderPolicy {
            timeout_ms: 0,
            ..ProviderPolicy::default()
        };
        assert!(registry.register(Arc::new(Named("a")), policy).is_err());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn policy_capabilities_override_adapter() {
        let (registry, _) = registry();
        let policy = ProviderPolicy {
            capabilities: Some(vec![Capability::VectorSearch]),
            ..ProviderPolicy::default()
        };
        registry
            .register(Arc::new(Named("v")), policy)
            .expect("register");
        let snapshot = registry.snapshot();
        let entry = snapshot.get("v").expect("entry");
        assert!(entry.supports(Capability::VectorSearch));
        assert!(!entry.supports(Capability::Search));
    }

    #[test]
    fn failures_open_circuit_and_mark_unhealthy() {
        let (registry, clock) = registry();
        let policy = ProviderPolicy {
            consecutive_failure_limit: 2,
            recovery_timeout_secs: 10,
            ..ProviderPolicy::default()
        };
        registry
            .register(Arc::new(Named("a")), policy)
            .expect("register");
        let snapshot = registry.snapshot();
        let entry = snapshot.get("a").expect("entry");
        let err = ProviderError::Upstream("boom".into());
        for _ in 0..2 {
            let now = clock.now();
            entry.admit(now).expect("admit");
            entry.record_failure(now, Duration::from_millis(5), &err);
        }
        assert!(entry.is_circuit_open(clock.now()));
        assert_eq!(entry.health_state(clock.now()), HealthState::Unhealthy);
        assert!(matches!(
            entry.admit(clock.now()),
            Err(ProviderError::CircuitOpen(_))
        ));

        clock.advance(Duration::from_secs(10));
        assert!(!entry.is_circuit_open(clock.now()));
        let stats = entry.stats(clock.now());
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn invalid_request_does_not_count_against_provider() {
        let (registry, clock) = registry();
        registry
            .register(Arc::new(Named("a")), ProviderPolicy::default())
            .expect("register");
        let snapshot = registry.snapshot();
        let entry = snapshot.get("a").expect("entry");
        let now = clock.now();
        entry.admit(now).expect("admit");
        entry.record_failure(now, Duration::ZERO, &ProviderError::InvalidRequest("bad".into()));
        let stats = entry.stats(now);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.circuit.failure_count, 0);
    }

    #[test]
    fn rate_limit_rejects_without_touching_circuit() {
        let (registry, clock) = registry();
        let policy = ProviderPolicy {
            rate_limit: Some(1),
            ..ProviderPolicy::default()
        };
        registry
            .register(Arc::new(Named("a")), policy)
            .expect("register");
        let snapshot = registry.snapshot();
        let entry = snapshot.get("a").expect("entry");
        let now = clock.now();
        assert!(entry.admit(now).is_ok());
        entry.record_success(now, Duration::from_millis(1));
        assert!(matches!(entry.admit(now), Err(ProviderError::RateLimited(_))));
        assert_eq!(entry.stats(now).circuit.failure_count, 0);
    }
}
