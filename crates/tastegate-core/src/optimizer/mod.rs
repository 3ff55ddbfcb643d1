//! Request orchestration: the `optimized_request` pipeline.
//!
//! Every call walks the same stages; each stage either produces data or
//! hands a classified failure to the next:
//!
//! ```text
//!   normalize key
//!        │
//!   primary cache ──hit──► return (from_cache)
//!        │ miss
//!   dedupe ──already in flight──► await shared outcome
//!        │ leader
//!   admission permit ─► breaker gate ─► fetch + retry loop
//!        │                                   │ success
//!        │                            adaptive-TTL cache write
//!        │ terminal failure                  │
//!   recovery chain: fallback value / fallback store / fail
//! ```
//!
//! The upstream pipeline runs inside the deduplicated producer, so
//! concurrent identical requests cost one permit, one breaker slot, and
//! one upstream call. The recovery chain runs per caller: two followers
//! of the same failed fetch may degrade differently depending on their
//! own fallback values.

use crate::{
    cache::{CacheStore, FallbackStore, RequestKey, TtlPolicy},
    classify::{classify_cache, classify_fetch, ErrorRecord, RecommendedAction},
    config::{ConfigUpdate, GatewayConfig},
    coordinator::{BatchFetchFn, BatchRequest, Batcher, AdmissionQueue, RequestCoordinator},
    metrics::{GatewayStats, MetricsCollector},
    resilience::{BreakerRegistry, RetryManager},
    types::{FetchError, FetchFn, Params, RequestOptions},
};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors from gateway construction.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration failed validation.
    #[error("invalid gateway configuration: {0}")]
    Config(String),

    /// Primary cache store could not be built.
    #[error(transparent)]
    Cache(#[from] crate::cache::CacheError),
}

/// Outcome of an orchestrated request.
///
/// `success` means the caller received data, live or degraded; `degraded`
/// distinguishes the two. `errors` carries every classified failure the
/// caller's path encountered, so UI code can badge stale results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub from_cache: bool,
    pub degraded: bool,
    pub response_time_ms: u64,
    pub errors: Vec<ErrorRecord>,
}

struct Inner {
    config: ArcSwap<GatewayConfig>,
    ttl: ArcSwap<TtlPolicy>,
    retry: ArcSwap<RetryManager>,
    store: CacheStore,
    fallback: FallbackStore,
    breakers: BreakerRegistry,
    coordinator: RequestCoordinator,
    admission: AdmissionQueue,
    batcher: Batcher,
    metrics: MetricsCollector,
}

/// The gateway entry point.
///
/// Cheap to clone; all state is shared. Built via [`GatewayBuilder`].
#[derive(Clone)]
pub struct RequestOptimizer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptimizer")
            .field("config", &self.inner.config.load())
            .field("cache", &self.inner.store.stats())
            .finish_non_exhaustive()
    }
}

impl RequestOptimizer {
    /// Runs one request through the full pipeline.
    #[instrument(skip_all, fields(entity = entity_type))]
    pub async fn optimized_request(
        &self,
        entity_type: &str,
        params: &Params,
        fetch: FetchFn,
        options: RequestOptions,
    ) -> OptimizationResult {
        let started = std::time::Instant::now();
        let key = RequestKey::normalize(entity_type, params);
        let mut errors = Vec::new();

        if !options.skip_cache {
            match self.inner.store.get(&key) {
                Ok(Some(value)) => {
                    self.inner.metrics.record_cache_hit();
                    self.inner.metrics.record_request(true, started.elapsed());
                    debug!(key = %key, "served from cache");
                    return OptimizationResult {
                        success: true,
                        data: Some(value),
                        from_cache: true,
                        degraded: false,
                        response_time_ms: started.elapsed().as_millis() as u64,
                        errors,
                    };
                }
                Ok(None) => self.inner.metrics.record_cache_miss(),
                Err(cache_error) => {
                    // A corrupt read is a miss with a record attached; the
                    // fetch below repopulates the entry
                    let record = classify_cache(&cache_error);
                    warn!(key = %key, error = %cache_error, "cache read failed, refetching");
                    self.inner.metrics.record_error(record.kind);
                    self.inner.metrics.record_cache_miss();
                    errors.push(record);
                }
            }
        }

        let config = self.inner.config.load();
        let score = if config.coordinator.priority_enabled { options.priority.score() } else { 1 };
        let timeout = options.timeout.unwrap_or_else(|| config.request_timeout());
        drop(config);

        let producer =
            Self::run_pipeline(Arc::clone(&self.inner), key.clone(), fetch, score, timeout);
        let outcome = self.inner.coordinator.dedupe(&key, producer).await;

        if outcome.deduplicated {
            self.inner.metrics.record_deduped();
        }

        match outcome.result {
            Ok(value) => {
                self.inner.metrics.record_request(true, started.elapsed());
                OptimizationResult {
                    success: true,
                    data: Some((*value).clone()),
                    from_cache: false,
                    degraded: false,
                    response_time_ms: started.elapsed().as_millis() as u64,
                    errors,
                }
            }
            Err(error) => {
                let record = classify_fetch(&error);
                errors.push(record.clone());
                self.recover(&key, &options, record, errors, started)
            }
        }
    }

    /// Runs one request through the multi-item path.
    ///
    /// Same cache, key, and recovery semantics as [`optimized_request`],
    /// but the upstream call is a coalesced batch shared with other
    /// same-entity-type requests arriving within the window. The batch
    /// path has no retry loop: a failed batch degrades immediately.
    ///
    /// [`optimized_request`]: Self::optimized_request
    #[instrument(skip_all, fields(entity = entity_type))]
    pub async fn optimized_batch_request(
        &self,
        entity_type: &str,
        params: &Params,
        fetch: BatchFetchFn,
        options: RequestOptions,
    ) -> OptimizationResult {
        let started = std::time::Instant::now();
        let key = RequestKey::normalize(entity_type, params);
        let mut errors = Vec::new();

        if !options.skip_cache {
            match self.inner.store.get(&key) {
                Ok(Some(value)) => {
                    self.inner.metrics.record_cache_hit();
                    self.inner.metrics.record_request(true, started.elapsed());
                    return OptimizationResult {
                        success: true,
                        data: Some(value),
                        from_cache: true,
                        degraded: false,
                        response_time_ms: started.elapsed().as_millis() as u64,
                        errors,
                    };
                }
                Ok(None) => self.inner.metrics.record_cache_miss(),
                Err(cache_error) => {
                    let record = classify_cache(&cache_error);
                    self.inner.metrics.record_error(record.kind);
                    self.inner.metrics.record_cache_miss();
                    errors.push(record);
                }
            }
        }

        let config = self.inner.config.load();
        let timeout = options.timeout.unwrap_or_else(|| config.request_timeout());
        let batching_enabled = config.coordinator.batching_enabled;
        let score = if config.coordinator.priority_enabled { options.priority.score() } else { 1 };
        let admission_wait = config.admission_wait();
        let scope = key.entity_type().to_string();
        let breaker = self.inner.breakers.for_scope(
            &scope,
            config.breaker.threshold,
            config.breaker_cooldown(),
        );
        drop(config);

        let generation = self.inner.coordinator.begin_generation(&key);
        let request = BatchRequest { key: key.clone(), params: params.clone() };

        // A batch member is still an upstream call: it passes the same
        // admission and breaker gates as the single-item pipeline
        let result = match self.inner.admission.acquire(score, admission_wait).await {
            None => Err(FetchError::Other("concurrency limit wait exhausted".into())),
            Some(_permit) => {
                if !breaker.try_acquire().await {
                    debug!(scope = %scope, "short-circuited by open breaker");
                    Err(FetchError::CircuitOpen { scope })
                } else {
                    let outcome = if batching_enabled {
                        self.inner.batcher.submit(entity_type, request, fetch, timeout).await
                    } else {
                        Self::single_batch_call(request, fetch, timeout).await
                    };
                    match &outcome {
                        Ok(_) => breaker.on_success().await,
                        Err(error) if classify_fetch(error).kind.should_trip_breaker() => {
                            breaker.on_failure().await;
                        }
                        // The upstream answered; a data-quality failure is
                        // not a health signal
                        Err(_) => breaker.on_success().await,
                    }
                    outcome
                }
            }
        };

        match result {
            Ok(value) => {
                self.write_back(&key, &value, generation);
                self.inner.metrics.record_request(true, started.elapsed());
                OptimizationResult {
                    success: true,
                    data: Some(value),
                    from_cache: false,
                    degraded: false,
                    response_time_ms: started.elapsed().as_millis() as u64,
                    errors,
                }
            }
            Err(error) => {
                let record = classify_fetch(&error);
                self.inner.metrics.record_error(record.kind);
                errors.push(record.clone());
                self.recover(&key, &options, record, errors, started)
            }
        }
    }

    /// One-request batch call used when batching is disabled.
    async fn single_batch_call(
        request: BatchRequest,
        fetch: BatchFetchFn,
        timeout: Duration,
    ) -> Result<serde_json::Value, FetchError> {
        let key = request.key.clone();
        let call = (fetch)(vec![request]);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(mut results)) => results.remove(key.as_str()).ok_or_else(|| {
                FetchError::InsufficientData(format!("batch response missing key {key}"))
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(FetchError::Timeout),
        }
    }

    /// The deduplicated upstream pipeline: admission, breaker gate, and
    /// the sequential retry loop, followed by the cache write-back.
    async fn run_pipeline(
        inner: Arc<Inner>,
        key: RequestKey,
        fetch: FetchFn,
        score: u8,
        timeout: Duration,
    ) -> Result<serde_json::Value, FetchError> {
        // The write generation starts here, not at the caller: dedupe
        // followers must not supersede the leader's own write
        let generation = inner.coordinator.begin_generation(&key);
        let config = inner.config.load();
        let admission_wait = config.admission_wait();
        let scope = key.entity_type().to_string();
        let breaker = inner.breakers.for_scope(
            &scope,
            config.breaker.threshold,
            config.breaker_cooldown(),
        );
        drop(config);

        let _permit = match inner.admission.acquire(score, admission_wait).await {
            Some(permit) => permit,
            None => {
                let error = FetchError::Other("concurrency limit wait exhausted".into());
                inner.metrics.record_error(classify_fetch(&error).kind);
                return Err(error);
            }
        };

        let retry = inner.retry.load_full();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            // Re-checked on every attempt: the breaker may have opened on
            // this scope mid-loop, or a failed probe may have re-armed it
            if !breaker.try_acquire().await {
                debug!(scope = %scope, "short-circuited by open breaker");
                let error = FetchError::CircuitOpen { scope: scope.clone() };
                inner.metrics.record_error(classify_fetch(&error).kind);
                return Err(error);
            }

            let outcome = match tokio::time::timeout(timeout, (fetch)()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            };

            match outcome {
                Ok(value) => {
                    breaker.on_success().await;
                    inner.write_back(&key, &value, generation);
                    return Ok(value);
                }
                Err(error) => {
                    let record = classify_fetch(&error);
                    inner.metrics.record_error(record.kind);
                    if record.kind.should_trip_breaker() {
                        breaker.on_failure().await;
                    } else {
                        // The upstream answered; a data-quality failure is
                        // not a health signal
                        breaker.on_success().await;
                    }

                    let hint = match &error {
                        FetchError::RateLimited { retry_after_ms: Some(ms), .. } => {
                            Some(Duration::from_millis(*ms))
                        }
                        _ => None,
                    };
                    let decision = retry.should_retry(record.kind, attempt, hint);
                    if record.retryable && decision.retry {
                        warn!(
                            key = %key,
                            attempt,
                            delay_ms = decision.delay.as_millis() as u64,
                            kind = record.kind.as_str(),
                            "retrying after failure"
                        );
                        tokio::time::sleep(decision.delay).await;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Serves degraded data after a terminal pipeline failure.
    ///
    /// The classified `recommended_action` orders the recovery chain;
    /// configuration errors never degrade.
    fn recover(
        &self,
        key: &RequestKey,
        options: &RequestOptions,
        record: ErrorRecord,
        errors: Vec<ErrorRecord>,
        started: std::time::Instant,
    ) -> OptimizationResult {
        let data = match record.recommended_action {
            RecommendedAction::Fail => None,
            RecommendedAction::FallbackToDegraded => {
                options.fallback_value.clone().or_else(|| self.inner.fallback.get(key))
            }
            RecommendedAction::Retry | RecommendedAction::FallbackToCache => {
                self.inner.fallback.get(key).or_else(|| options.fallback_value.clone())
            }
        };

        self.inner.metrics.record_request(false, started.elapsed());
        let degraded = data.is_some();
        if degraded {
            self.inner.metrics.record_degraded();
            info!(key = %key, kind = record.kind.as_str(), "serving degraded response");
        } else {
            warn!(key = %key, kind = record.kind.as_str(), "request failed with no fallback");
        }

        OptimizationResult {
            success: degraded,
            data,
            from_cache: false,
            degraded,
            response_time_ms: started.elapsed().as_millis() as u64,
            errors,
        }
    }

    fn write_back(&self, key: &RequestKey, value: &serde_json::Value, generation: u64) {
        self.inner.write_back(key, value, generation);
    }

    /// Removes one entry from both cache tiers and starts a new write
    /// generation, so any in-flight fetch for the old state cannot write
    /// over the invalidation.
    pub fn invalidate(&self, entity_type: &str, params: &Params) {
        let key = RequestKey::normalize(entity_type, params);
        self.inner.coordinator.begin_generation(&key);
        self.inner.store.invalidate(&key);
        self.inner.fallback.invalidate(&key);
    }

    /// Clears the primary cache, optionally scoped to an entity-type
    /// prefix. Returns the number of entries removed.
    pub fn clear_cache(&self, entity_type: Option<&str>) -> usize {
        match entity_type {
            Some(entity) => {
                let prefix = format!("{}?", entity.trim().to_lowercase());
                self.inner.store.clear(Some(&prefix))
            }
            None => self.inner.store.clear(None),
        }
    }

    /// Assembles the rolling statistics snapshot.
    pub async fn get_stats(&self) -> GatewayStats {
        let breaker_states = self.inner.breakers.snapshot().await;
        self.inner.metrics.snapshot(breaker_states)
    }

    /// Primary store statistics (entries, bytes, hit/miss counters).
    #[must_use]
    pub fn cache_stats(&self) -> crate::cache::CacheStoreStats {
        self.inner.store.stats()
    }

    /// Zeroes the rolling metrics counters.
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Applies a partial configuration overlay at runtime.
    ///
    /// TTL policy, retry policy, timeouts, and toggles take effect on the
    /// next request. Breaker settings apply to scopes first seen after
    /// the update; store sizing and the concurrency limit require a
    /// rebuild.
    pub fn update_config(&self, update: &ConfigUpdate) {
        let next = update.apply(&self.inner.config.load());
        info!("gateway configuration updated");
        self.inner.ttl.store(Arc::new(next.ttl_policy()));
        self.inner.retry.store(Arc::new(RetryManager::new(next.retry.clone())));
        self.inner.config.store(Arc::new(next));
    }

    /// Current effective configuration.
    #[must_use]
    pub fn config(&self) -> Arc<GatewayConfig> {
        self.inner.config.load_full()
    }

    /// Drops wedged in-flight entries and expired fallback data.
    /// Intended to be called from a periodic maintenance task.
    pub fn sweep(&self) -> usize {
        self.inner.coordinator.sweep()
    }
}

impl Inner {
    /// Writes a fetched value to both cache tiers under the adaptive TTL,
    /// unless a newer generation (invalidation or later fetch) has
    /// superseded this write.
    fn write_back(&self, key: &RequestKey, value: &serde_json::Value, generation: u64) {
        if !self.coordinator.is_current(key, generation) {
            debug!(key = %key, "skipping stale cache write");
            return;
        }

        let size = serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0);
        let ttl = self.ttl.load().compute(key.entity_type(), size);

        if let Err(error) = self.store.set(key, value, ttl) {
            let record = classify_cache(&error);
            self.metrics.record_error(record.kind);
            warn!(key = %key, error = %error, "primary cache write failed");
        }
        // Degraded copy regardless of the primary write outcome
        self.fallback.put(key, value.clone());
    }
}

/// Builds a [`RequestOptimizer`] from a validated configuration.
pub struct GatewayBuilder {
    config: GatewayConfig,
}

impl GatewayBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self { config: GatewayConfig::default() }
    }

    #[must_use]
    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and assembles the gateway.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if validation fails or the primary store
    /// cannot be built.
    pub fn build(self) -> Result<RequestOptimizer, GatewayError> {
        self.config.validate().map_err(GatewayError::Config)?;
        let config = self.config;

        let store = CacheStore::new(&config.store_config())?;
        let fallback = FallbackStore::new(config.fallback_ttl(), config.cache.fallback_soft_capacity);
        let admission = AdmissionQueue::new(config.limits.max_concurrent_requests);
        let coordinator = RequestCoordinator::new(config.inflight_stale_after());
        let batcher = Batcher::new(config.batch_window(), config.coordinator.max_batch_size);

        info!(
            max_concurrent = config.limits.max_concurrent_requests,
            cache_entries = config.cache.max_entries,
            strategy = ?config.cache.strategy,
            "gateway built"
        );

        Ok(RequestOptimizer {
            inner: Arc::new(Inner {
                ttl: ArcSwap::from_pointee(config.ttl_policy()),
                retry: ArcSwap::from_pointee(RetryManager::new(config.retry.clone())),
                store,
                fallback,
                breakers: BreakerRegistry::new(),
                coordinator,
                admission,
                batcher,
                metrics: MetricsCollector::new(),
                config: ArcSwap::from_pointee(config),
            }),
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
