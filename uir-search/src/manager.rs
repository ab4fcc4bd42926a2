//! Provider manager: concurrent, fault-isolated provider execution.
//!
//! # Pipeline
//!
//! 1. Select providers for the operation (health tiers, capability,
//!    access policy, fan-out limit).
//! 2. For every selected provider, concurrently:
//!    - ask the rate limiter and circuit breaker for admission; a refusal
//!      short-circuits without calling the adapter
//!    - invoke the adapter, bounded by the provider's timeout and the
//!      request deadline
//!    - record latency and outcome into health and circuit state
//!    - retry transient failures with exponential backoff, if configured
//! 3. Join the calls, or stop at the request deadline. Calls still running
//!    at the deadline are dropped (which cancels them) and reported as
//!    timeouts.
//! 4. If every primary failed, run the fallback batch the same way.
//!
//! One failing provider never fails its siblings. The manager always
//! returns a per-provider outcome list; [`Execution::failure`] reports
//! whether the batch as a whole failed.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{ProviderError, SearchError};
use crate::registry::{ProviderEntry, ProviderRegistry, ProviderStats};
use crate::selector::{ProviderSelector, SelectionRequest};
use crate::spans::{FIELD_PROVIDER, SPAN_PROVIDER_CALL};
use crate::types::{Capability, Document, SearchOptions, SearchResult, VectorQuery};

/// Maximum backoff between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// What to run against each selected provider.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Keyword search.
    Search {
        /// Query text.
        query: String,
        /// Options forwarded to the adapter.
        options: SearchOptions,
    },
    /// Nearest-neighbour search.
    VectorSearch {
        /// Query vector and scope.
        query: VectorQuery,
        /// Options forwarded to the adapter.
        options: SearchOptions,
    },
}

impl Operation {
    /// Capability a provider needs for this operation.
    pub fn capability(&self) -> Capability {
        match self {
            Self::Search { .. } => Capability::Search,
            Self::VectorSearch { .. } => Capability::VectorSearch,
        }
    }
}

/// Per-execution knobs.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteOptions<'a> {
    /// Hard deadline for the whole batch, fallbacks included.
    pub deadline: Instant,
    /// Providers to try only if every primary fails.
    pub fallbacks: &'a [String],
    /// Caps the fan-out below the engine's limit.
    pub max_providers: Option<usize>,
    /// Caller identity for the access policy.
    pub caller: Option<&'a str>,
}

/// Outcome of one provider within an execution.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    /// Provider name.
    pub provider: String,
    /// Results or the reason there are none.
    pub result: Result<Vec<SearchResult>, ProviderError>,
    /// Wall time spent on this provider, retries included.
    pub latency: Duration,
    /// Adapter invocations made.
    pub attempts: u32,
    /// Whether the provider ran in the fallback batch.
    pub fallback: bool,
}

/// Everything that happened during one execution.
#[derive(Debug, Default)]
pub struct Execution {
    /// Per-provider outcomes: primaries in selection order, then
    /// fallbacks, then providers rejected before any call.
    pub calls: Vec<ProviderCall>,
    /// Unhealthy providers left out by the selector.
    pub skipped: Vec<String>,
    /// True when only unhealthy providers could be tried.
    pub degraded_service: bool,
    /// True when the request deadline cut the execution short.
    pub deadline_hit: bool,
}

impl Execution {
    /// Number of providers that returned results.
    pub fn success_count(&self) -> usize {
        self.calls.iter().filter(|c| c.result.is_ok()).count()
    }

    /// The batch-level error, if no provider succeeded.
    ///
    /// A deadline that expired before any provider answered is reported as
    /// [`SearchError::DeadlineExceeded`]; otherwise every failure reason is
    /// folded into [`SearchError::AllProvidersFailed`].
    pub fn failure(&self) -> Option<SearchError> {
        if self.success_count() > 0 {
            return None;
        }
        if self.calls.is_empty() {
            return Some(SearchError::NoProviders(
                "no requested provider could be selected".into(),
            ));
        }
        let reasons = self
            .calls
            .iter()
            .filter_map(|c| c.result.as_ref().err().map(|e| format!("{}: {e}", c.provider)))
            .collect::<Vec<_>>()
            .join("; ");
        if self.deadline_hit {
            Some(SearchError::DeadlineExceeded(reasons))
        } else {
            Some(SearchError::AllProvidersFailed(reasons))
        }
    }
}

/// Result of a liveness probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthProbe {
    /// Whether the provider answered.
    pub ok: bool,
    /// Probe latency.
    pub latency_ms: u64,
}

/// Returns an admission to the circuit breaker if the call is dropped
/// before it records an outcome.
struct Admission<'a> {
    entry: &'a ProviderEntry,
    armed: bool,
}

impl<'a> Admission<'a> {
    fn new(entry: &'a ProviderEntry) -> Self {
        Self { entry, armed: true }
    }

    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.entry.release();
        }
    }
}

/// Composes the registry, selector and per-provider resilience policy.
pub struct ProviderManager {
    registry: Arc<ProviderRegistry>,
    selector: ProviderSelector,
    max_fan_out: usize,
}

impl ProviderManager {
    /// Create a manager over `registry`.
    pub fn new(registry: Arc<ProviderRegistry>, selector: ProviderSelector, config: &EngineConfig) -> Self {
        Self {
            registry,
            selector,
            max_fan_out: config.max_fan_out,
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Whether the access policy lets `caller` use `provider`.
    pub fn permits(&self, caller: Option<&str>, provider: &str) -> bool {
        self.selector.permits(caller, provider)
    }

    /// Run `operation` against `providers`, concurrently, under one deadline.
    pub async fn execute(
        &self,
        providers: &[String],
        operation: &Operation,
        options: &ExecuteOptions<'_>,
    ) -> Execution {
        let snapshot = self.registry.snapshot();
        let now = self.registry.clock().now();
        let max_fan_out = options
            .max_providers
            .map_or(self.max_fan_out, |cap| cap.min(self.max_fan_out));
        let selection = self.selector.select(
            &snapshot,
            &SelectionRequest {
                requested: providers,
                fallbacks: options.fallbacks,
                capability: operation.capability(),
                max_fan_out,
                caller: options.caller,
            },
            now,
        );
        tracing::debug!(
            primary = selection.primary.len(),
            fallback = selection.fallback.len(),
            rejected = selection.rejected.len(),
            degraded = selection.degraded_service,
            "providers selected"
        );

        let mut execution = Execution {
            skipped: selection.skipped,
            degraded_service: selection.degraded_service,
            ..Execution::default()
        };

        let (calls, deadline_hit) = self
            .fan_out(&selection.primary, operation, options.deadline, false)
            .await;
        execution.calls = calls;
        execution.deadline_hit = deadline_hit;

        if execution.success_count() == 0 && !deadline_hit && !selection.fallback.is_empty() {
            tracing::info!(
                count = selection.fallback.len(),
                "all primary providers failed; trying fallbacks"
            );
            let (calls, deadline_hit) = self
                .fan_out(&selection.fallback, operation, options.deadline, true)
                .await;
            execution.calls.extend(calls);
            execution.deadline_hit = deadline_hit;
        }

        execution
            .calls
            .extend(selection.rejected.into_iter().map(|(provider, err)| ProviderCall {
                provider,
                result: Err(err),
                latency: Duration::ZERO,
                attempts: 0,
                fallback: false,
            }));
        execution
    }

    /// Send documents to a single provider under the same admission,
    /// timeout and retry policy as searches.
    ///
    /// Returns the number of accepted documents (or why there are none)
    /// together with the adapter invocations made.
    pub async fn execute_index(
        &self,
        provider: &str,
        documents: &[Document],
        index_name: Option<&str>,
        caller: Option<&str>,
        deadline: Instant,
    ) -> (Result<usize, ProviderError>, u32) {
        let snapshot = self.registry.snapshot();
        let Some(entry) = snapshot.get(provider) else {
            return (
                Err(ProviderError::InvalidRequest(format!("unknown provider {provider}"))),
                0,
            );
        };
        if !self.selector.permits(caller, provider) {
            return (
                Err(ProviderError::AccessDenied(format!("caller may not use {provider}"))),
                0,
            );
        }
        if !entry.supports(Capability::Index) {
            return (
                Err(ProviderError::Unsupported(format!("{provider} does not support index"))),
                0,
            );
        }
        let adapter = Arc::clone(entry.adapter());
        let (result, attempts, _) = self
            .call_with_policy(entry, deadline, |call_deadline| {
                let adapter = Arc::clone(&adapter);
                async move { adapter.index(documents, index_name, call_deadline).await }
            })
            .await;
        (result, attempts)
    }

    /// Probe every registered provider once, recording the outcome as an
    /// idle heartbeat.
    pub async fn health_check_all(&self) -> BTreeMap<String, HealthProbe> {
        let snapshot = self.registry.snapshot();
        let probes = snapshot.entries().iter().map(|entry| async move {
            let started = Instant::now();
            let ok = matches!(
                tokio::time::timeout(entry.timeout(), entry.adapter().health_check()).await,
                Ok(Ok(()))
            );
            let latency = started.elapsed();
            entry.record_heartbeat(ok, latency);
            if !ok {
                tracing::warn!(provider = %entry.name(), "health check failed");
            }
            (
                entry.name().to_string(),
                HealthProbe {
                    ok,
                    latency_ms: latency.as_millis() as u64,
                },
            )
        });
        futures::future::join_all(probes).await.into_iter().collect()
    }

    /// Run [`health_check_all`](Self::health_check_all) every `interval`
    /// until `cancel` fires.
    pub fn spawn_health_monitor(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "health monitor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("health monitor cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let probes = self.health_check_all().await;
                        let failing = probes.values().filter(|p| !p.ok).count();
                        tracing::debug!(providers = probes.len(), failing, "health sweep complete");
                    }
                }
            }
        })
    }

    /// Stats for every registered provider.
    pub fn provider_stats(&self) -> Vec<ProviderStats> {
        let now = self.registry.clock().now();
        self.registry
            .snapshot()
            .entries()
            .iter()
            .map(|entry| entry.stats(now))
            .collect()
    }

    async fn fan_out(
        &self,
        entries: &[Arc<ProviderEntry>],
        operation: &Operation,
        deadline: Instant,
        fallback: bool,
    ) -> (Vec<ProviderCall>, bool) {
        let started = Instant::now();
        let mut slots: Vec<Option<ProviderCall>> = entries.iter().map(|_| None).collect();
        let mut pending: FuturesUnordered<_> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let span = tracing::debug_span!(SPAN_PROVIDER_CALL, { FIELD_PROVIDER } = %entry.name(), fallback);
                async move { (i, self.call_provider(entry, operation, deadline, fallback).await) }
                    .instrument(span)
            })
            .collect();

        let mut deadline_hit = false;
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((i, call))) => slots[i] = Some(call),
                Ok(None) => break,
                Err(_) => {
                    deadline_hit = true;
                    break;
                }
            }
        }
        // Dropping the set cancels whatever is still running.
        drop(pending);
        // Calls cut off by the request deadline inside their own timeout
        // count as hitting it too.
        deadline_hit |= Instant::now() >= deadline;

        let calls = slots
            .into_iter()
            .zip(entries)
            .map(|(slot, entry)| {
                slot.unwrap_or_else(|| {
                    tracing::warn!(provider = %entry.name(), "cancelled at request deadline");
                    ProviderCall {
                        provider: entry.name().to_string(),
                        result: Err(ProviderError::Timeout(
                            "request deadline reached before the provider answered".into(),
                        )),
                        latency: started.elapsed(),
                        attempts: 1,
                        fallback,
                    }
                })
            })
            .collect();
        (calls, deadline_hit)
    }

    async fn call_provider(
        &self,
        entry: &ProviderEntry,
        operation: &Operation,
        deadline: Instant,
        fallback: bool,
    ) -> ProviderCall {
        let adapter = entry.adapter();
        let (result, attempts, latency) = self
            .call_with_policy(entry, deadline, |call_deadline| async move {
                match operation {
                    Operation::Search { query, options } => {
                        adapter.search(query, options, call_deadline).await
                    }
                    Operation::VectorSearch { query, options } => {
                        adapter.vector_search(query, options, call_deadline).await
                    }
                }
            })
            .await;

        let result = result.map(|mut results| {
            for result in &mut results {
                if result.provider.is_empty() {
                    result.provider = entry.name().to_string();
                }
            }
            results
        });
        match &result {
            Ok(results) => tracing::debug!(
                provider = %entry.name(),
                count = results.len(),
                attempts,
                "provider returned results"
            ),
            Err(err) => tracing::warn!(
                provider = %entry.name(),
                code = err.code(),
                error = %err,
                attempts,
                "provider call failed"
            ),
        }
        ProviderCall {
            provider: entry.name().to_string(),
            result,
            latency,
            attempts,
            fallback,
        }
    }

    /// Admission, bounded invocation, outcome recording and retries for one
    /// provider. Returns the result, the number of adapter invocations and
    /// the total time spent.
    async fn call_with_policy<T, F, Fut>(
        &self,
        entry: &ProviderEntry,
        deadline: Instant,
        invoke: F,
    ) -> (Result<T, ProviderError>, u32, Duration)
    where
        F: Fn(Instant) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let clock = self.registry.clock();
        let policy = entry.policy();
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut last_err: Option<ProviderError> = None;

        loop {
            if let Err(refused) = entry.admit(clock.now()) {
                // A refusal after a real failure reports the real failure.
                let err = last_err.unwrap_or(refused);
                return (Err(err), attempts, started.elapsed());
            }
            let admission = Admission::new(entry);
            attempts += 1;

            let call_started = Instant::now();
            let call_deadline = deadline.min(call_started + entry.timeout());
            let outcome = match tokio::time::timeout_at(call_deadline, invoke(call_deadline)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(format!(
                    "no answer within {}ms",
                    call_deadline.saturating_duration_since(call_started).as_millis()
                ))),
            };
            let elapsed = call_started.elapsed();

            let err = match outcome {
                Ok(value) => {
                    entry.record_success(clock.now(), elapsed);
                    admission.settle();
                    return (Ok(value), attempts, started.elapsed());
                }
                Err(err) => {
                    entry.record_failure(clock.now(), elapsed, &err);
                    admission.settle();
                    err
                }
            };

            if !err.is_retryable() || attempts > policy.retry_attempts {
                return (Err(err), attempts, started.elapsed());
            }
            let backoff = backoff_delay(policy.retry_backoff_ms, attempts);
            if Instant::now() + backoff >= deadline {
                return (Err(err), attempts, started.elapsed());
            }
            tracing::debug!(
                provider = %entry.name(),
                attempt = attempts,
                backoff_ms = backoff.as_millis() as u64,
                "retrying after transient failure"
            );
            tokio::time::sleep(backoff).await;
            last_err = Some(err);
        }
    }
}

/// Exponential backoff with up to 50% jitter, capped at [`MAX_BACKOFF`].
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let jitter = if exp > 1 {
        rand::thread_rng().gen_range(0..=exp / 2)
    } else {
        0
    };
    Duration::from_millis(exp.saturating_add(jitter)).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::access::AllowAll;
    use crate::clock::ManualClock;
    use crate::config::{LoadBalancing, ProviderPolicy};
    use crate::health::HealthThresholds;
    use crate::provider::ProviderAdapter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Behaviour {
        Ok(Vec<SearchResult>),
        Fail(ProviderError),
        Hang,
        /// Fail this many times, then succeed.
        Flaky(u32),
    }

    struct Fake {
        name: &'static str,
        behaviour: Behaviour,
        calls: AtomicU32,
    }

    impl Fake {
        fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name,
                behaviour,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ProviderAdapter for Fake {
        fn name(&self) -> &str {
            self.name
        }

        async fn search(
            &self,
            _query: &str,
            _options: &SearchOptions,
            _deadline: Instant,
        ) -> Result<Vec<SearchResult>, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behaviour {
                Behaviour::Ok(results) => Ok(results.clone()),
                Behaviour::Fail(err) => Err(err.clone()),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok(vec![])
                }
                Behaviour::Flaky(failures) if n < *failures => {
                    Err(ProviderError::Upstream("flaky".into()))
                }
                Behaviour::Flaky(_) => Ok(vec![SearchResult::new("ok", self.name, 1.0)]),
            }
        }
    }

    fn manager(providers: Vec<(Arc<Fake>, ProviderPolicy)>) -> ProviderManager {
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(ProviderRegistry::new(HealthThresholds::default(), clock));
        for (adapter, policy) in providers {
            registry.register(adapter, policy).expect("register");
        }
        let selector = ProviderSelector::new(LoadBalancing::HealthOnly, Arc::new(AllowAll));
        ProviderManager::new(registry, selector, &EngineConfig::default())
    }

    fn search_op() -> Operation {
        Operation::Search {
            query: "rust".into(),
            options: SearchOptions::default(),
        }
    }

    fn options(deadline: Instant) -> ExecuteOptions<'static> {
        ExecuteOptions {
            deadline,
            fallbacks: &[],
            max_providers: None,
            caller: None,
        }
    }

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_keeps_successful_results() {
        let fast = Fake::new("fast", Behaviour::Ok(vec![SearchResult::new("1", "fast", 1.0)]));
        let broken = Fake::new("broken", Behaviour::Fail(ProviderError::Upstream("503".into())));
        let manager = manager(vec![
            (fast, ProviderPolicy::default()),
            (broken, ProviderPolicy::default()),
        ]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let execution = manager
            .execute(&strings(&["fast", "broken"]), &search_op(), &options(deadline))
            .await;
        assert_eq!(execution.success_count(), 1);
        assert!(execution.failure().is_none());
        assert_eq!(execution.calls[0].provider, "fast");
        assert!(matches!(execution.calls[1].result, Err(ProviderError::Upstream(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_timeout_reports_timeout() {
        let slow = Fake::new("slow", Behaviour::Hang);
        let fast = Fake::new("fast", Behaviour::Ok(vec![]));
        let policy = ProviderPolicy {
            timeout_ms: 100,
            ..ProviderPolicy::default()
        };
        let manager = manager(vec![(slow, policy), (fast, ProviderPolicy::default())]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let execution = manager
            .execute(&strings(&["slow", "fast"]), &search_op(), &options(deadline))
            .await;
        assert!(matches!(execution.calls[0].result, Err(ProviderError::Timeout(_))));
        assert!(execution.calls[1].result.is_ok());
        assert!(!execution.deadline_hit);
    }

    #[tokio::test(start_paused = true)]
    async fn global_deadline_cancels_in_flight_calls() {
        let slow = Fake::new("slow", Behaviour::Hang);
        let manager = manager(vec![(slow, ProviderPolicy::default())]);
        let deadline = Instant::now() + Duration::from_millis(50);
        let execution = manager
            .execute(&strings(&["slow"]), &search_op(), &options(deadline))
            .await;
        assert!(execution.deadline_hit);
        assert!(matches!(execution.calls[0].result, Err(ProviderError::Timeout(_))));
        assert!(matches!(execution.failure(), Some(SearchError::DeadlineExceeded(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn all_failed_reports_aggregate_error() {
        let a = Fake::new("a", Behaviour::Fail(ProviderError::Upstream("down".into())));
        let manager = manager(vec![(a, ProviderPolicy::default())]);
        let deadline = Instant::now() + Duration::from_secs(1);
        let execution = manager
            .execute(&strings(&["a"]), &search_op(), &options(deadline))
            .await;
        let err = execution.failure().expect("failure");
        assert!(matches!(err, SearchError::AllProvidersFailed(_)));
        assert!(err.to_string().contains("a: upstream error: down"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_recover_from_transient_failures() {
        let flaky = Fake::new("flaky", Behaviour::Flaky(2));
        let policy = ProviderPolicy {
            retry_attempts: 2,
            retry_backoff_ms: 10,
            ..ProviderPolicy::default()
        };
        let manager = manager(vec![(flaky.clone(), policy)]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let execution = manager
            .execute(&strings(&["flaky"]), &search_op(), &options(deadline))
            .await;
        assert!(execution.calls[0].result.is_ok());
        assert_eq!(execution.calls[0].attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_is_not_retried() {
        let bad = Fake::new("bad", Behaviour::Fail(ProviderError::InvalidRequest("syntax".into())));
        let policy = ProviderPolicy {
            retry_attempts: 3,
            ..ProviderPolicy::default()
        };
        let manager = manager(vec![(bad.clone(), policy)]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let execution = manager
            .execute(&strings(&["bad"]), &search_op(), &options(deadline))
            .await;
        assert_eq!(execution.calls[0].attempts, 1);
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_runs_only_when_primaries_fail() {
        let primary = Fake::new("primary", Behaviour::Fail(ProviderError::Upstream("x".into())));
        let backup = Fake::new("backup", Behaviour::Ok(vec![SearchResult::new("b", "backup", 0.5)]));
        let manager = manager(vec![
            (primary, ProviderPolicy::default()),
            (backup.clone(), ProviderPolicy::default()),
        ]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let fallbacks = strings(&["backup"]);
        let execution = manager
            .execute(
                &strings(&["primary"]),
                &search_op(),
                &ExecuteOptions {
                    fallbacks: &fallbacks,
                    ..options(deadline)
                },
            )
            .await;
        assert_eq!(execution.success_count(), 1);
        assert!(execution.calls[1].fallback);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_not_called_when_a_primary_succeeds() {
        let primary = Fake::new("primary", Behaviour::Ok(vec![]));
        let backup = Fake::new("backup", Behaviour::Ok(vec![]));
        let manager = manager(vec![
            (primary, ProviderPolicy::default()),
            (backup.clone(), ProviderPolicy::default()),
        ]);
        let deadline = Instant::now() + Duration::from_secs(5);
        let fallbacks = strings(&["backup"]);
        let execution = manager
            .execute(
                &strings(&["primary"]),
                &search_op(),
                &ExecuteOptions {
                    fallbacks: &fallbacks,
                    ..options(deadline)
                },
            )
            .await;
        assert_eq!(execution.calls.len(), 1);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_provider_is_reported_not_called() {
        let manager = manager(vec![]);
        let deadline = Instant::now() + Duration::from_secs(1);
        let execution = manager
            .execute(&strings(&["ghost"]), &search_op(), &options(deadline))
            .await;
        assert_eq!(execution.calls.len(), 1);
        assert_eq!(execution.calls[0].attempts, 0);
        assert!(matches!(execution.failure(), Some(SearchError::AllProvidersFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_provider_is_short_circuited() {
        let limited = Fake::new("limited", Behaviour::Ok(vec![]));
        let policy = ProviderPolicy {
            rate_limit: Some(1),
            ..ProviderPolicy::default()
        };
        let manager = manager(vec![(limited.clone(), policy)]);
        let deadline = Instant::now() + Duration::from_secs(1);
        let providers = strings(&["limited"]);
        manager.execute(&providers, &search_op(), &options(deadline)).await;
        let second = manager.execute(&providers, &search_op(), &options(deadline)).await;
        assert!(matches!(second.calls[0].result, Err(ProviderError::RateLimited(_))));
        assert_eq!(limited.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_all_records_heartbeats() {
        let a = Fake::new("a", Behaviour::Ok(vec![]));
        let manager = manager(vec![(a, ProviderPolicy::default())]);
        let probes = manager.health_check_all().await;
        assert!(probes["a"].ok);
        let stats = manager.provider_stats();
        assert_eq!(stats[0].health.total_calls, 1);
        assert_eq!(stats[0].calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn health_monitor_stops_on_cancel() {
        let a = Fake::new("a", Behaviour::Ok(vec![]));
        let manager = Arc::new(manager(vec![(a, ProviderPolicy::default())]));
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&manager).spawn_health_monitor(Duration::from_secs(1), cancel.clone());
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        cancel.cancel();
        handle.await.expect("join");
        assert!(manager.provider_stats()[0].health.total_calls >= 2);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let first = backoff_delay(100, 1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let second = backoff_delay(100, 2);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));
        assert_eq!(backoff_delay(10_000, 10), MAX_BACKOFF);
    }
}
