//! Request router: the top-level coordinator for one incoming request.
//!
//! # Request lifecycle
//!
//! ```text
//! received ─> cache_check ─┬─> done                       (hit)
//!                          └─> querying ─> aggregating ─┬─> caching ─> done
//!                                  │                    └─> done  (not cacheable)
//!                                  └─> failed
//! ```
//!
//! Validation happens in `received`: an unknown fusion method or malformed
//! weights fail the request before any provider is called. The router
//! never retries; bounded retries belong to the provider manager.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregator::{rerank, Aggregator, FusionMethod};
use crate::cache::{cache_key, normalize_query, CacheManager, CacheStats};
use crate::config::EngineConfig;
use crate::embedding::Embedder;
use crate::error::{ProviderError, SearchError};
use crate::health::HealthState;
use crate::manager::{ExecuteOptions, Execution, Operation, ProviderManager};
use crate::registry::ProviderStats;
use crate::spans::{FIELD_OPERATION, FIELD_REQUEST_ID, SPAN_ROUTER_REQUEST};
use crate::types::{
    ErrorInfo, HybridSearchRequest, IndexRequest, IndexResponse, ProviderOutcome,
    ResponseMetadata, ResponseStatus, SearchOptions, SearchRequest, SearchResponse, SearchResult,
    StrategyKind, VectorQuery, VectorSearchRequest,
};

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    Received,
    CacheCheck,
    Querying,
    Aggregating,
    Caching,
    Done,
    Failed,
}

impl RequestPhase {
    fn can_advance_to(self, next: Self) -> bool {
        use RequestPhase::*;
        matches!(
            (self, next),
            (Received, CacheCheck | Querying | Failed)
                | (CacheCheck, Done | Querying | Failed)
                | (Querying, Aggregating | Failed)
                | (Aggregating, Caching | Done | Failed)
                | (Caching, Done)
        )
    }
}

/// Per-request bookkeeping.
struct RequestContext {
    id: String,
    phase: RequestPhase,
    started: Instant,
    deadline: Instant,
}

impl RequestContext {
    fn new(deadline: Instant) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            phase: RequestPhase::Received,
            started: Instant::now(),
            deadline,
        }
    }

    fn advance(&mut self, next: RequestPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.phase,
            next
        );
        tracing::trace!(from = ?self.phase, to = ?next, "request phase");
        self.phase = next;
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Terminal failure before or instead of a normal response.
    fn fail(&mut self, err: &SearchError) -> SearchResponse {
        self.advance(RequestPhase::Failed);
        tracing::warn!(code = err.code(), error = %err, "request failed");
        let mut response = SearchResponse::error(self.id.clone(), err);
        response.metadata.query_time_ms = self.elapsed_ms();
        response
    }
}

/// Successful lists and per-provider bookkeeping, ready for fusion.
#[derive(Default)]
struct Collected {
    lists: Vec<Vec<SearchResult>>,
    weights: Vec<f64>,
    outcomes: BTreeMap<String, ProviderOutcome>,
    used: Vec<String>,
    failed: Vec<String>,
    skipped: Vec<String>,
    degraded_service: bool,
    failure: Option<SearchError>,
}

impl Collected {
    /// Record one execution. `label` names each outcome (usually the
    /// provider itself); `weight` gives the fusion weight for a provider.
    fn absorb(
        &mut self,
        execution: Execution,
        label: impl Fn(&str) -> String,
        weight: impl Fn(&str) -> f64,
    ) {
        for call in execution.calls {
            let key = label(&call.provider);
            let latency_ms = u64::try_from(call.latency.as_millis()).unwrap_or(u64::MAX);
            let outcome = match call.result {
                Ok(results) => {
                    self.used.push(key.clone());
                    self.weights.push(weight(&call.provider));
                    let count = results.len();
                    self.lists.push(results);
                    ProviderOutcome {
                        result_count: count,
                        latency_ms,
                        attempts: call.attempts,
                        fallback: call.fallback,
                        error: None,
                    }
                }
                Err(err) => {
                    self.failed.push(key.clone());
                    ProviderOutcome {
                        result_count: 0,
                        latency_ms,
                        attempts: call.attempts,
                        fallback: call.fallback,
                        error: Some(err),
                    }
                }
            };
            self.outcomes.insert(key, outcome);
        }
        self.skipped.extend(execution.skipped);
        self.degraded_service |= execution.degraded_service;
    }

    fn record_failure(&mut self, label: String, err: ProviderError) {
        self.failed.push(label.clone());
        self.outcomes.insert(
            label,
            ProviderOutcome {
                result_count: 0,
                latency_ms: 0,
                attempts: 0,
                fallback: false,
                error: Some(err),
            },
        );
    }
}

/// Provider and cache statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    /// Providers currently healthy.
    pub healthy: usize,
    /// Providers currently degraded.
    pub degraded: usize,
    /// Providers currently unhealthy.
    pub unhealthy: usize,
    /// Per-provider detail.
    pub providers: Vec<ProviderStats>,
    /// Cache counters.
    pub cache: CacheStats,
}

/// Coordinates cache, provider execution and fusion for every request.
pub struct Router {
    config: EngineConfig,
    manager: Arc<ProviderManager>,
    cache: Arc<CacheManager>,
    aggregator: Aggregator,
    embedder: Option<Arc<dyn Embedder>>,
}

impl Router {
    /// Create a router. `config` should be the one the manager and cache
    /// were built from.
    pub fn new(config: EngineConfig, manager: Arc<ProviderManager>, cache: Arc<CacheManager>) -> Self {
        let aggregator = Aggregator::new(config.rrf_k);
        Self {
            config,
            manager,
            cache,
            aggregator,
            embedder: None,
        }
    }

    /// Use `embedder` for vector queries that arrive as text.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// The provider manager.
    pub fn manager(&self) -> &Arc<ProviderManager> {
        &self.manager
    }

    /// The cache.
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Keyword search across `request.providers`.
    ///
    /// `deadline` is the caller's hard deadline; the effective deadline is
    /// the earlier of it and `options.timeout_ms` (or the engine default).
    /// Never returns an error: failures are reported in the response.
    pub async fn handle_search(
        &self,
        request: &SearchRequest,
        deadline: Option<Instant>,
    ) -> SearchResponse {
        let ctx = RequestContext::new(self.deadline(&request.options, deadline));
        let span = tracing::info_span!(
            SPAN_ROUTER_REQUEST,
            { FIELD_REQUEST_ID } = %ctx.id,
            { FIELD_OPERATION } = "search"
        );
        self.search_inner(request, ctx).instrument(span).await
    }

    async fn search_inner(&self, request: &SearchRequest, mut ctx: RequestContext) -> SearchResponse {
        tracing::trace!(query = %request.query, "search request");
        let options = &request.options;
        let method = match self.validate(&request.providers, options).and_then(|method| {
            if request.query.trim().is_empty() {
                Err(SearchError::Validation("query must not be empty".into()))
            } else {
                Ok(method)
            }
        }) {
            Ok(method) => method,
            Err(err) => return ctx.fail(&err),
        };

        let cacheable = self.cacheable_for(request.caller.as_deref(), &request.providers, options);
        let key = cacheable.then(|| {
            cache_key(
                "search",
                &request.providers,
                Value::String(normalize_query(&request.query)),
                options,
            )
        });
        if let Some(hit) = self.check_cache(&mut ctx, key.as_deref()).await {
            return hit;
        }

        ctx.advance(RequestPhase::Querying);
        let operation = Operation::Search {
            query: request.query.clone(),
            options: options.clone(),
        };
        let execution = self
            .manager
            .execute(
                &request.providers,
                &operation,
                &ExecuteOptions {
                    deadline: ctx.deadline,
                    fallbacks: &options.fallback_providers,
                    max_providers: options.max_providers,
                    caller: request.caller.as_deref(),
                },
            )
            .await;

        let collected = collect_in_order(execution, &request.providers, options);
        self.finish(ctx, collected, method, options, Some(&request.query), key)
            .await
    }

    /// Nearest-neighbour search with a vector, or with text embedded first.
    pub async fn handle_vector_search(
        &self,
        request: &VectorSearchRequest,
        deadline: Option<Instant>,
    ) -> SearchResponse {
        let ctx = RequestContext::new(self.deadline(&request.options, deadline));
        let span = tracing::info_span!(
            SPAN_ROUTER_REQUEST,
            { FIELD_REQUEST_ID } = %ctx.id,
            { FIELD_OPERATION } = "vector_search"
        );
        self.vector_inner(request, ctx).instrument(span).await
    }

    async fn vector_inner(
        &self,
        request: &VectorSearchRequest,
        mut ctx: RequestContext,
    ) -> SearchResponse {
        let options = &request.options;
        let text = request
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let vector = request.vector.as_ref().filter(|v| !v.is_empty());

        let method = match self.validate(&request.providers, options).and_then(|method| {
            match (vector, text, &self.embedder) {
                (Some(_), _, _) | (None, Some(_), Some(_)) => Ok(method),
                (None, Some(_), None) => Err(SearchError::Validation(
                    "text query given but no embedder is configured".into(),
                )),
                (None, None, _) => Err(SearchError::Validation(
                    "either a vector or text is required".into(),
                )),
            }
        }) {
            Ok(method) => method,
            Err(err) => return ctx.fail(&err),
        };

        // Key on the text when there is one, so a hit skips the embedding.
        let cacheable = self.cacheable_for(request.caller.as_deref(), &request.providers, options);
        let key = cacheable.then(|| {
            let query = match vector {
                Some(v) => json!({ "vector": v }),
                None => json!({
                    "text": text.map(normalize_query),
                    "model": self.embedder.as_ref().map(|e| e.model_name().to_string()),
                }),
            };
            let query = json!({
                "input": query,
                "index": request.index,
                "namespace": request.namespace,
            });
            cache_key("vector_search", &request.providers, query, options)
        });
        if let Some(hit) = self.check_cache(&mut ctx, key.as_deref()).await {
            return hit;
        }

        ctx.advance(RequestPhase::Querying);
        let vector = match vector {
            Some(v) => v.clone(),
            None => match self.embed(text.unwrap_or_default(), ctx.deadline).await {
                Ok(v) => v,
                Err(err) => return ctx.fail(&err),
            },
        };

        let operation = Operation::VectorSearch {
            query: VectorQuery {
                vector,
                index: request.index.clone(),
                namespace: request.namespace.clone(),
            },
            options: options.clone(),
        };
        let execution = self
            .manager
            .execute(
                &request.providers,
                &operation,
                &ExecuteOptions {
                    deadline: ctx.deadline,
                    fallbacks: &options.fallback_providers,
                    max_providers: options.max_providers,
                    caller: request.caller.as_deref(),
                },
            )
            .await;

        let collected = collect_in_order(execution, &request.providers, options);
        self.finish(ctx, collected, method, options, text, key).await
    }

    /// Run several keyword and vector strategies concurrently and fuse
    /// them, weighting each list by its strategy's weight.
    ///
    /// Outcomes are keyed by provider; a provider used by more than one
    /// strategy gets `provider#<n>` keys for the later ones.
    pub async fn handle_hybrid_search(
        &self,
        request: &HybridSearchRequest,
        deadline: Option<Instant>,
    ) -> SearchResponse {
        let ctx = RequestContext::new(self.deadline(&request.options, deadline));
        let span = tracing::info_span!(
            SPAN_ROUTER_REQUEST,
            { FIELD_REQUEST_ID } = %ctx.id,
            { FIELD_OPERATION } = "hybrid_search"
        );
        self.hybrid_inner(request, ctx).instrument(span).await
    }

    async fn hybrid_inner(
        &self,
        request: &HybridSearchRequest,
        mut ctx: RequestContext,
    ) -> SearchResponse {
        let options = &request.options;
        let providers: Vec<String> = request.strategies.iter().map(|s| s.provider.clone()).collect();
        let method = match self
            .validate(&providers, options)
            .and_then(|method| self.validate_strategies(request).map(|()| method))
        {
            Ok(method) => method,
            Err(err) => return ctx.fail(&err),
        };

        let cacheable = self.cacheable_for(request.caller.as_deref(), &providers, options);
        let key = cacheable.then(|| {
            let strategies: Vec<Value> = request
                .strategies
                .iter()
                .map(|s| {
                    json!({
                        "type": s.kind,
                        "provider": s.provider,
                        "weight": s.weight,
                        "query": s.query.as_deref().map(normalize_query),
                        "text": s.text.as_deref().map(normalize_query),
                        "vector": s.vector,
                    })
                })
                .collect();
            cache_key("hybrid_search", &providers, Value::Array(strategies), options)
        });
        if let Some(hit) = self.check_cache(&mut ctx, key.as_deref()).await {
            return hit;
        }

        ctx.advance(RequestPhase::Querying);
        let deadline = ctx.deadline;
        let legs = request.strategies.iter().map(|strategy| async move {
            let operation = match strategy.kind {
                StrategyKind::Keyword => Operation::Search {
                    query: strategy.query.clone().unwrap_or_default(),
                    options: options.clone(),
                },
                StrategyKind::Vector => {
                    let vector = match strategy.vector.as_ref().filter(|v| !v.is_empty()) {
                        Some(v) => v.clone(),
                        None => {
                            let text = strategy.text.as_deref().unwrap_or_default();
                            match self.embed(text, deadline).await {
                                Ok(v) => v,
                                Err(err) => {
                                    return Err(ProviderError::Upstream(format!(
                                        "embedding failed: {err}"
                                    )));
                                }
                            }
                        }
                    };
                    Operation::VectorSearch {
                        query: VectorQuery {
                            vector,
                            index: None,
                            namespace: None,
                        },
                        options: options.clone(),
                    }
                }
            };
            let execution = self
                .manager
                .execute(
                    std::slice::from_ref(&strategy.provider),
                    &operation,
                    &ExecuteOptions {
                        deadline,
                        fallbacks: &[],
                        max_providers: None,
                        caller: request.caller.as_deref(),
                    },
                )
                .await;
            Ok(execution)
        });
        let results = futures::future::join_all(legs).await;

        let mut collected = Collected::default();
        let mut uses: HashMap<&str, usize> = HashMap::new();
        let mut deadline_hit = false;
        for (strategy, result) in request.strategies.iter().zip(results) {
            let n = uses.entry(strategy.provider.as_str()).or_insert(0);
            *n += 1;
            let label = if *n == 1 {
                strategy.provider.clone()
            } else {
                format!("{}#{}", strategy.provider, n)
            };
            match result {
                Ok(execution) => {
                    deadline_hit |= execution.deadline_hit;
                    collected.absorb(execution, |_| label.clone(), |_| strategy.weight);
                }
                Err(err) => collected.record_failure(label, err),
            }
        }
        if collected.used.is_empty() {
            let reasons = collected
                .outcomes
                .iter()
                .filter_map(|(name, o)| o.error.as_ref().map(|e| format!("{name}: {e}")))
                .collect::<Vec<_>>()
                .join("; ");
            collected.failure = Some(if deadline_hit {
                SearchError::DeadlineExceeded(reasons)
            } else {
                SearchError::AllProvidersFailed(reasons)
            });
        }

        let rerank_text = request
            .strategies
            .iter()
            .find_map(|s| s.query.as_deref().or(s.text.as_deref()));
        self.finish(ctx, collected, method, options, rerank_text, key)
            .await
    }

    /// Send documents to one provider.
    pub async fn handle_index(&self, request: &IndexRequest, deadline: Option<Instant>) -> IndexResponse {
        let span = tracing::info_span!(
            SPAN_ROUTER_REQUEST,
            { FIELD_REQUEST_ID } = %Uuid::new_v4(),
            { FIELD_OPERATION } = "index"
        );
        async {
            if request.documents.is_empty() {
                return IndexResponse {
                    status: ResponseStatus::Error,
                    provider: request.provider.clone(),
                    indexed: 0,
                    error: Some(ProviderError::InvalidRequest("no documents to index".into())),
                };
            }
            let deadline = self.deadline(&SearchOptions::default(), deadline);
            let (result, attempts) = self
                .manager
                .execute_index(
                    &request.provider,
                    &request.documents,
                    request.index_name.as_deref(),
                    request.caller.as_deref(),
                    deadline,
                )
                .await;
            match result {
                Ok(indexed) => {
                    tracing::info!(provider = %request.provider, indexed, attempts, "documents indexed");
                    IndexResponse {
                        status: ResponseStatus::Success,
                        provider: request.provider.clone(),
                        indexed,
                        error: None,
                    }
                }
                Err(err) => {
                    tracing::warn!(provider = %request.provider, code = err.code(), error = %err, "indexing failed");
                    IndexResponse {
                        status: ResponseStatus::Error,
                        provider: request.provider.clone(),
                        indexed: 0,
                        error: Some(err),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Drop cached responses matching `pattern` (all when `None`).
    pub async fn invalidate_cache(&self, pattern: Option<&str>) -> u64 {
        self.cache.invalidate(pattern).await
    }

    /// Per-provider stats.
    pub fn provider_stats(&self) -> Vec<ProviderStats> {
        self.manager.provider_stats()
    }

    /// Cache counters.
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Provider counts per health state, provider detail and cache counters.
    pub async fn stats(&self) -> EngineStats {
        let providers = self.provider_stats();
        let count = |state: HealthState| providers.iter().filter(|p| p.health.state == state).count();
        EngineStats {
            healthy: count(HealthState::Healthy),
            degraded: count(HealthState::Degraded),
            unhealthy: count(HealthState::Unhealthy),
            cache: self.cache_stats().await,
            providers,
        }
    }

    fn deadline(&self, options: &SearchOptions, caller: Option<Instant>) -> Instant {
        let timeout_ms = options.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let own = Instant::now() + Duration::from_millis(timeout_ms);
        caller.map_or(own, |caller| caller.min(own))
    }

    /// Whether this request may read or write the shared response cache.
    ///
    /// Cached responses are keyed by request, not by caller. A caller
    /// denied any requested or fallback provider neither reads nor writes
    /// them.
    fn cacheable_for(&self, caller: Option<&str>, providers: &[String], options: &SearchOptions) -> bool {
        if !options.cache.enabled {
            return false;
        }
        let denied = providers
            .iter()
            .chain(&options.fallback_providers)
            .find(|p| !self.manager.permits(caller, p));
        if let Some(provider) = denied {
            tracing::debug!(
                caller = caller.unwrap_or("anonymous"),
                provider = %provider,
                "caller denied a provider, bypassing cache"
            );
            return false;
        }
        true
    }

    /// Checks shared by every search flavour. Returns the fusion method.
    fn validate(&self, providers: &[String], options: &SearchOptions) -> Result<FusionMethod, SearchError> {
        let method = options.fusion(self.config.fusion_default_method)?;
        if providers.is_empty() || providers.iter().any(|p| p.trim().is_empty()) {
            return Err(SearchError::Validation(
                "at least one provider name is required".into(),
            ));
        }
        if options.limit == 0 {
            return Err(SearchError::Validation("limit must be at least 1".into()));
        }
        if let Some(weights) = &options.weights {
            if weights.len() != providers.len() {
                return Err(SearchError::Validation(format!(
                    "{} weights supplied for {} providers",
                    weights.len(),
                    providers.len()
                )));
            }
            if weights.iter().any(|w| !w.is_finite()) {
                return Err(SearchError::Validation("weights must be finite".into()));
            }
        }
        if options.min_score.is_some_and(|s| !s.is_finite()) {
            return Err(SearchError::Validation("min_score must be finite".into()));
        }
        Ok(method)
    }

    fn validate_strategies(&self, request: &HybridSearchRequest) -> Result<(), SearchError> {
        if request.options.weights.is_some() {
            return Err(SearchError::Validation(
                "hybrid searches take weights from their strategies".into(),
            ));
        }
        for (i, strategy) in request.strategies.iter().enumerate() {
            if !strategy.weight.is_finite() {
                return Err(SearchError::Validation(format!("strategy {i}: weight must be finite")));
            }
            let ok = match strategy.kind {
                StrategyKind::Keyword => strategy.query.as_deref().is_some_and(|q| !q.trim().is_empty()),
                StrategyKind::Vector => {
                    strategy.vector.as_ref().is_some_and(|v| !v.is_empty())
                        || (strategy.text.as_deref().is_some_and(|t| !t.trim().is_empty())
                            && self.embedder.is_some())
                }
            };
            if !ok {
                return Err(SearchError::Validation(format!(
                    "strategy {i} ({}) has nothing to search with",
                    strategy.provider
                )));
            }
        }
        Ok(())
    }

    async fn embed(&self, text: &str, deadline: Instant) -> Result<Vec<f32>, SearchError> {
        let Some(embedder) = &self.embedder else {
            return Err(SearchError::Embedding("no embedder configured".into()));
        };
        match tokio::time::timeout_at(deadline, embedder.embed(text, deadline)).await {
            Ok(Ok(vector)) if !vector.is_empty() => Ok(vector),
            Ok(Ok(_)) => Err(SearchError::Embedding(format!(
                "{} returned an empty vector",
                embedder.model_name()
            ))),
            Ok(Err(err)) => Err(SearchError::Embedding(format!("{}: {err}", embedder.model_name()))),
            Err(_) => Err(SearchError::DeadlineExceeded(format!(
                "{} did not finish before the deadline",
                embedder.model_name()
            ))),
        }
    }

    /// `cache_check` phase. Returns the response to send on a hit.
    async fn check_cache(&self, ctx: &mut RequestContext, key: Option<&str>) -> Option<SearchResponse> {
        let key = key?;
        ctx.advance(RequestPhase::CacheCheck);
        let (entry, tier) = self.cache.get(key).await?;
        let mut response: SearchResponse = match serde_json::from_str(&entry.payload) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable cached response, treating as miss");
                return None;
            }
        };
        response.request_id = ctx.id.clone();
        response.from_cache = true;
        response.metadata.query_time_ms = ctx.elapsed_ms();
        ctx.advance(RequestPhase::Done);
        tracing::info!(?tier, results = response.results.len(), "served from cache");
        Some(response)
    }

    /// `aggregating` and `caching` phases.
    async fn finish(
        &self,
        mut ctx: RequestContext,
        collected: Collected,
        method: FusionMethod,
        options: &SearchOptions,
        rerank_text: Option<&str>,
        key: Option<String>,
    ) -> SearchResponse {
        let Collected {
            lists,
            weights,
            outcomes,
            used,
            failed,
            skipped,
            degraded_service,
            failure,
        } = collected;

        let mut metadata = ResponseMetadata {
            providers_used: used,
            providers_failed: failed,
            providers_skipped: skipped,
            degraded_service,
            fingerprint: key.clone(),
            ..ResponseMetadata::default()
        };

        if let Some(err) = failure {
            let mut response = ctx.fail(&err);
            response.per_provider_outcomes = outcomes;
            metadata.query_time_ms = response.metadata.query_time_ms;
            response.metadata = metadata;
            return response;
        }

        ctx.advance(RequestPhase::Aggregating);
        let aggregation = match self.aggregator.aggregate(
            lists,
            Some(&weights),
            method,
            options.deduplicate,
        ) {
            Ok(aggregation) => aggregation,
            Err(err) => {
                let mut response = ctx.fail(&err);
                response.per_provider_outcomes = outcomes;
                return response;
            }
        };

        let mut results = aggregation.results;
        if options.rerank {
            if let Some(text) = rerank_text {
                results = rerank(results, text);
            }
        }
        if let Some(min) = options.min_score {
            results.retain(|r| r.score >= min);
        }
        metadata.total_results = results.len();
        metadata.fusion_method = Some(aggregation.method);
        let results: Vec<SearchResult> = results
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .collect();

        let status = if metadata.providers_failed.is_empty() {
            ResponseStatus::Success
        } else {
            ResponseStatus::Partial
        };
        metadata.query_time_ms = ctx.elapsed_ms();
        let response = SearchResponse {
            status,
            request_id: ctx.id.clone(),
            results,
            per_provider_outcomes: outcomes,
            from_cache: false,
            metadata,
            errors: Vec::<ErrorInfo>::new(),
        };
        tracing::info!(
            status = ?response.status,
            results = response.results.len(),
            used = response.metadata.providers_used.len(),
            failed = response.metadata.providers_failed.len(),
            elapsed_ms = response.metadata.query_time_ms,
            "request complete"
        );

        match key {
            Some(key) if status == ResponseStatus::Success => {
                ctx.advance(RequestPhase::Caching);
                match serde_json::to_string(&response) {
                    Ok(payload) => {
                        let ttl = options.cache.ttl_seconds.map(Duration::from_secs);
                        self.cache.put(&key, payload, ttl).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "response not cacheable"),
                }
            }
            _ => {}
        }
        ctx.advance(RequestPhase::Done);
        response
    }
}

/// Turn one execution into fusion input, ordering lists by the request's
/// provider order (then fallbacks) so fusion tie-breaks follow the caller.
fn collect_in_order(mut execution: Execution, requested: &[String], options: &SearchOptions) -> Collected {
    let rank_of = |name: &str| {
        requested
            .iter()
            .chain(&options.fallback_providers)
            .position(|p| p == name)
            .unwrap_or(usize::MAX)
    };
    execution.calls.sort_by_key(|call| rank_of(&call.provider));

    let weight_of = |name: &str| {
        options
            .weights
            .as_ref()
            .and_then(|w| requested.iter().position(|p| p == name).and_then(|i| w.get(i)))
            .copied()
            .unwrap_or(1.0)
    };
    let failure = execution.failure();
    let mut collected = Collected::default();
    collected.absorb(execution, str::to_string, weight_of);
    collected.failure = failure;
    collected
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::access::{AccessPolicy, AllowAll};
    use crate::aggregator::STRATEGY_SCORES_KEY;
    use crate::clock::ManualClock;
    use crate::config::{LoadBalancing, ProviderPolicy};
    use crate::health::HealthThresholds;
    use crate::provider::ProviderAdapter;
    use crate::registry::ProviderRegistry;
    use crate::selector::ProviderSelector;
    use crate::types::{Capability, Document, HybridStrategy};

    struct Stub {
        name: &'static str,
        results: Vec<SearchResult>,
        fail: Option<ProviderError>,
        calls: AtomicU32,
    }

    impl Stub {
        fn ok(name: &'static str, results: Vec<SearchResult>) -> Arc<Self> {
            Arc::new(Self {
                name,
                results,
                fail: None,
                calls: AtomicU32::new(0),
            })
        }

        fn failing(name: &'static str, err: ProviderError) -> Arc<Self> {
            Arc::new(Self {
                name,
                results: vec![],
                fail: Some(err),
                calls: AtomicU32::new(0),
            })
        }

        fn respond(&self) -> Result<Vec<SearchResult>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail {
                Some(err) => Err(err.clone()),
                None => Ok(self.results.clone()),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for Stub {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::Search, Capability::VectorSearch, Capability::Index]
        }

        async fn search(
            &self,
            _query: &str,
            _options: &SearchOptions,
            _deadline: Instant,
        ) -> Result<Vec<SearchResult>, ProviderError> {
            self.respond()
        }

        async fn vector_search(
            &self,
            _query: &VectorQuery,
            _options: &SearchOptions,
            _deadline: Instant,
        ) -> Result<Vec<SearchResult>, ProviderError> {
            self.respond()
        }

        async fn index(
            &self,
            documents: &[Document],
            _index: Option<&str>,
            _deadline: Instant,
        ) -> Result<usize, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(documents.len())
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn embed(&self, _text: &str, _deadline: Instant) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn router(stubs: Vec<Arc<Stub>>) -> Router {
        router_with_access(stubs, Arc::new(AllowAll))
    }

    fn router_with_access(stubs: Vec<Arc<Stub>>, access: Arc<dyn AccessPolicy>) -> Router {
        let config = EngineConfig::default();
        let registry = Arc::new(ProviderRegistry::new(
            HealthThresholds::from(&config),
            Arc::new(ManualClock::new()),
        ));
        for stub in stubs {
            registry.register(stub, ProviderPolicy::default()).expect("register");
        }
        let selector = ProviderSelector::new(LoadBalancing::HealthOnly, access);
        let manager = Arc::new(ProviderManager::new(registry, selector, &config));
        let cache = Arc::new(CacheManager::new(&config));
        Router::new(config, manager, cache).with_embedder(Arc::new(FixedEmbedder))
    }

    fn doc(id: &str, provider: &str, score: f64) -> SearchResult {
        SearchResult::new(id, provider, score).with_url(format!("https://docs.test/{id}"))
    }

    #[test]
    fn phase_transitions() {
        use RequestPhase::*;
        assert!(Received.can_advance_to(CacheCheck));
        assert!(CacheCheck.can_advance_to(Done));
        assert!(Aggregating.can_advance_to(Caching));
        assert!(!Done.can_advance_to(Querying));
        assert!(!Failed.can_advance_to(Done));
        assert!(!CacheCheck.can_advance_to(Caching));
    }

    #[tokio::test]
    async fn successful_search_is_cached() {
        let a = Stub::ok("a", vec![doc("1", "a", 0.9), doc("2", "a", 0.5)]);
        let router = router(vec![a.clone()]);
        let request = SearchRequest::new(["a"], "rust");

        let first = router.handle_search(&request, None).await;
        assert_eq!(first.status, ResponseStatus::Success);
        assert!(!first.from_cache);
        assert_eq!(first.results.len(), 2);
        assert_eq!(first.metadata.fusion_method, Some(FusionMethod::Plain));

        let second = router.handle_search(&request, None).await;
        assert!(second.from_cache);
        assert_eq!(second.results, first.results);
        assert_ne!(second.request_id, first.request_id);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }

    fn admin_only_secret() -> Arc<dyn AccessPolicy> {
        Arc::new(|caller: Option<&str>, provider: &str| provider != "secret" || caller == Some("admin"))
    }

    #[tokio::test]
    async fn admin_warms_the_cache_then_a_guest_is_denied() {
        let public = Stub::ok("public", vec![doc("p1", "public", 0.5)]);
        let secret = Stub::ok("secret", vec![doc("classified", "secret", 0.9)]);
        let router = router_with_access(vec![public.clone(), secret.clone()], admin_only_secret());

        let mut request = SearchRequest::new(["public", "secret"], "plans");
        request.caller = Some("admin".into());
        let admin = router.handle_search(&request, None).await;
        assert_eq!(admin.status, ResponseStatus::Success);
        assert_eq!(admin.results.len(), 2);
        assert!(router.handle_search(&request, None).await.from_cache);

        request.caller = Some("guest".into());
        for _ in 0..2 {
            let guest = router.handle_search(&request, None).await;
            assert!(!guest.from_cache);
            assert!(guest.metadata.fingerprint.is_none());
            assert_eq!(guest.status, ResponseStatus::Partial);
            assert_eq!(guest.metadata.providers_failed, vec!["secret".to_string()]);
            assert!(guest.results.iter().all(|r| r.provider != "secret"));
        }
        assert_eq!(secret.calls.load(Ordering::SeqCst), 1);
        assert_eq!(public.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn guest_cannot_read_a_cached_secret_only_response() {
        let secret = Stub::ok("secret", vec![doc("classified", "secret", 0.9)]);
        let router = router_with_access(vec![secret.clone()], admin_only_secret());

        let mut request = VectorSearchRequest {
            providers: vec!["secret".into()],
            vector: Some(vec![1.0, 0.0]),
            text: None,
            index: None,
            namespace: None,
            options: SearchOptions::default(),
            caller: Some("admin".into()),
        };
        assert_eq!(router.handle_vector_search(&request, None).await.status, ResponseStatus::Success);

        request.caller = None;
        let anonymous = router.handle_vector_search(&request, None).await;
        assert!(!anonymous.from_cache);
        assert_eq!(anonymous.status, ResponseStatus::Error);
        assert!(anonymous.results.is_empty());
        assert_eq!(secret.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partial_responses_are_not_cached() {
        let a = Stub::ok("a", vec![doc("1", "a", 0.9)]);
        let b = Stub::failing("b", ProviderError::Upstream("502".into()));
        let router = router(vec![a.clone(), b]);
        let request = SearchRequest::new(["a", "b"], "rust");

        let first = router.handle_search(&request, None).await;
        assert_eq!(first.status, ResponseStatus::Partial);
        assert_eq!(first.metadata.providers_failed, vec!["b".to_string()]);
        let second = router.handle_search(&request, None).await;
        assert!(!second.from_cache);
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_can_be_bypassed() {
        let a = Stub::ok("a", vec![doc("1", "a", 0.9)]);
        let router = router(vec![a.clone()]);
        let mut request = SearchRequest::new(["a"], "rust");
        request.options.cache.enabled = false;
        router.handle_search(&request, None).await;
        let second = router.handle_search(&request, None).await;
        assert!(!second.from_cache);
        assert!(second.metadata.fingerprint.is_none());
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_fusion_method_rejected_before_any_call() {
        let a = Stub::ok("a", vec![doc("1", "a", 0.9)]);
        let router = router(vec![a.clone()]);
        let mut request = SearchRequest::new(["a"], "rust");
        request.options.fusion_method = Some("borda".into());
        let response = router.handle_search(&request, None).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.errors[0].code, "INVALID_FUSION_METHOD");
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_query_rejected() {
        let router = router(vec![Stub::ok("a", vec![])]);
        let response = router.handle_search(&SearchRequest::new(["a"], "  "), None).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.errors[0].code, "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn all_failed_is_an_error_with_outcomes() {
        let a = Stub::failing("a", ProviderError::InvalidRequest("bad".into()));
        let router = router(vec![a]);
        let response = router.handle_search(&SearchRequest::new(["a"], "rust"), None).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.errors[0].code, "ALL_PROVIDERS_FAILED");
        assert!(response.per_provider_outcomes["a"].error.is_some());
    }

    #[tokio::test]
    async fn fusion_follows_request_order_and_weights() {
        let a = Stub::ok("a", vec![doc("x", "a", 1.0)]);
        let b = Stub::ok("b", vec![doc("y", "b", 1.0)]);
        let router = router(vec![a, b]);
        let mut request = SearchRequest::new(["b", "a"], "rust");
        request.options.fusion_method = Some("weighted_sum".into());
        request.options.weights = Some(vec![0.2, 0.8]);
        let response = router.handle_search(&request, None).await;
        assert_eq!(response.metadata.fusion_method, Some(FusionMethod::WeightedSum));
        // a carries weight 0.8, b 0.2.
        assert_eq!(response.results[0].id, "x");
        assert!((response.results[0].score - 0.8).abs() < 1e-12);
    }

    #[tokio::test]
    async fn offset_limit_and_min_score_apply_after_fusion() {
        let a = Stub::ok(
            "a",
            vec![doc("1", "a", 0.9), doc("2", "a", 0.7), doc("3", "a", 0.5), doc("4", "a", 0.1)],
        );
        let router = router(vec![a]);
        let mut request = SearchRequest::new(["a"], "rust");
        request.options.min_score = Some(0.3);
        request.options.offset = 1;
        request.options.limit = 1;
        let response = router.handle_search(&request, None).await;
        assert_eq!(response.metadata.total_results, 3);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id, "2");
    }

    #[tokio::test]
    async fn vector_search_embeds_text() {
        let a = Stub::ok("a", vec![doc("v", "a", 0.4)]);
        let router = router(vec![a]);
        let request = VectorSearchRequest {
            providers: vec!["a".into()],
            vector: None,
            text: Some("nearest things".into()),
            index: None,
            namespace: None,
            options: SearchOptions::default(),
            caller: None,
        };
        let response = router.handle_vector_search(&request, None).await;
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.results[0].id, "v");
    }

    #[tokio::test]
    async fn vector_search_needs_input() {
        let router = router(vec![Stub::ok("a", vec![])]);
        let request = VectorSearchRequest {
            providers: vec!["a".into()],
            vector: None,
            text: None,
            index: None,
            namespace: None,
            options: SearchOptions::default(),
            caller: None,
        };
        let response = router.handle_vector_search(&request, None).await;
        assert_eq!(response.errors[0].code, "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn hybrid_search_fuses_strategies() {
        let kw = Stub::ok("kw", vec![doc("shared", "kw", 0.9), doc("kw-only", "kw", 0.4)]);
        let vec_store = Stub::ok("vec", vec![doc("shared", "vec", 0.8)]);
        let router = router(vec![kw, vec_store]);
        let request = HybridSearchRequest {
            strategies: vec![
                HybridStrategy {
                    kind: StrategyKind::Keyword,
                    provider: "kw".into(),
                    weight: 0.5,
                    query: Some("rust".into()),
                    text: None,
                    vector: None,
                },
                HybridStrategy {
                    kind: StrategyKind::Vector,
                    provider: "vec".into(),
                    weight: 0.5,
                    query: None,
                    text: Some("rust".into()),
                    vector: None,
                },
            ],
            options: SearchOptions::default(),
            caller: None,
        };
        let response = router.handle_hybrid_search(&request, None).await;
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.results[0].id, "shared");
        let scores = response.results[0].metadata[STRATEGY_SCORES_KEY]
            .as_object()
            .expect("strategy scores");
        assert_eq!(scores.len(), 2);
        assert_eq!(response.per_provider_outcomes.len(), 2);
    }

    #[tokio::test]
    async fn hybrid_labels_repeated_providers() {
        let both = Stub::ok("both", vec![doc("1", "both", 0.9)]);
        let router = router(vec![both]);
        let strategy = |kind| HybridStrategy {
            kind,
            provider: "both".into(),
            weight: 1.0,
            query: Some("rust".into()),
            text: Some("rust".into()),
            vector: None,
        };
        let request = HybridSearchRequest {
            strategies: vec![strategy(StrategyKind::Keyword), strategy(StrategyKind::Vector)],
            options: SearchOptions::default(),
            caller: None,
        };
        let response = router.handle_hybrid_search(&request, None).await;
        assert!(response.per_provider_outcomes.contains_key("both"));
        assert!(response.per_provider_outcomes.contains_key("both#2"));
    }

    #[tokio::test]
    async fn index_reports_accepted_documents() {
        let a = Stub::ok("a", vec![]);
        let router = router(vec![a]);
        let request = IndexRequest {
            provider: "a".into(),
            documents: vec![Document {
                id: "d1".into(),
                title: Some("T".into()),
                content: None,
                url: None,
                vector: None,
                metadata: Default::default(),
            }],
            index_name: None,
            caller: None,
        };
        let response = router.handle_index(&request, None).await;
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.indexed, 1);

        let unknown = IndexRequest {
            provider: "nope".into(),
            ..request
        };
        let response = router.handle_index(&unknown, None).await;
        assert_eq!(response.status, ResponseStatus::Error);
    }

    #[tokio::test]
    async fn stats_count_health_states() {
        let router = router(vec![Stub::ok("a", vec![]), Stub::ok("b", vec![])]);
        let stats = router.stats().await;
        assert_eq!(stats.healthy, 2);
        assert_eq!(stats.providers.len(), 2);
    }
}
