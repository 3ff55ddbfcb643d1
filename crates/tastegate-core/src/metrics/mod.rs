//! Rolling gateway statistics.
//!
//! Two paths, fed from the same call sites: cheap in-process atomics for
//! the [`GatewayStats`] snapshot callers poll, and the `metrics` facade
//! (counters and histograms) for whatever exporter the embedding
//! application installs. The collector never allocates on the hot path
//! except for first-seen error-kind labels.

use crate::{classify::ErrorKind, resilience::BreakerSnapshot};
use dashmap::DashMap;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// EWMA smoothing factor for average response time.
const RESPONSE_TIME_ALPHA: f64 = 0.2;

/// Point-in-time statistics snapshot returned by `get_stats()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Hits over hits + misses; zero before any lookup.
    pub cache_hit_rate: f64,
    /// Exponentially weighted moving average, milliseconds.
    pub avg_response_time_ms: f64,
    /// Failed over total; zero before any request.
    pub error_rate: f64,
    pub deduped_requests: u64,
    pub degraded_responses: u64,
    /// Failure counts per classified kind label.
    pub error_breakdown: HashMap<String, u64>,
    /// Current breaker state per upstream scope.
    pub circuit_breaker_states: HashMap<String, BreakerSnapshot>,
}

/// Lock-free counters behind every `get_stats()` field.
#[derive(Default)]
pub struct MetricsCollector {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    deduped_requests: AtomicU64,
    degraded_responses: AtomicU64,
    /// EWMA in milliseconds, stored as f64 bits.
    avg_response_time_bits: AtomicU64,
    errors_by_kind: DashMap<&'static str, AtomicU64, ahash::RandomState>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finished request: success or failure, plus its latency.
    pub fn record_request(&self, success: bool, elapsed: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.fold_response_time(elapsed.as_secs_f64() * 1000.0);

        counter!("tastegate_requests_total", "outcome" => if success { "success" } else { "failure" })
            .increment(1);
        histogram!("tastegate_request_duration_seconds").record(elapsed.as_secs_f64());
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        counter!("tastegate_cache_lookups_total", "result" => "hit").increment(1);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        counter!("tastegate_cache_lookups_total", "result" => "miss").increment(1);
    }

    /// Records a request that shared an already-in-flight upstream call.
    pub fn record_deduped(&self) {
        self.deduped_requests.fetch_add(1, Ordering::Relaxed);
        counter!("tastegate_deduped_requests_total").increment(1);
    }

    /// Records a response served from a fallback path rather than live data.
    pub fn record_degraded(&self) {
        self.degraded_responses.fetch_add(1, Ordering::Relaxed);
        counter!("tastegate_degraded_responses_total").increment(1);
    }

    /// Records one classified failure in the per-kind breakdown.
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors_by_kind
            .entry(kind.as_str())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        counter!("tastegate_errors_total", "kind" => kind.as_str()).increment(1);
    }

    fn fold_response_time(&self, sample_ms: f64) {
        let mut current = self.avg_response_time_bits.load(Ordering::Relaxed);
        loop {
            let avg = f64::from_bits(current);
            let next = if avg == 0.0 {
                sample_ms
            } else {
                avg + RESPONSE_TIME_ALPHA * (sample_ms - avg)
            };
            match self.avg_response_time_bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Assembles a snapshot; breaker states are supplied by the caller
    /// since the registry lives alongside, not inside, the collector.
    #[must_use]
    pub fn snapshot(
        &self,
        circuit_breaker_states: HashMap<String, BreakerSnapshot>,
    ) -> GatewayStats {
        let total = self.total_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        GatewayStats {
            total_requests: total,
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: failed,
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            avg_response_time_ms: f64::from_bits(self.avg_response_time_bits.load(Ordering::Relaxed)),
            error_rate: if total == 0 { 0.0 } else { failed as f64 / total as f64 },
            deduped_requests: self.deduped_requests.load(Ordering::Relaxed),
            degraded_responses: self.degraded_responses.load(Ordering::Relaxed),
            error_breakdown: self
                .errors_by_kind
                .iter()
                .map(|e| (e.key().to_string(), e.value().load(Ordering::Relaxed)))
                .collect(),
            circuit_breaker_states,
        }
    }

    /// Zeroes every counter. Exporter-side metrics are monotonic and are
    /// not reset.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.deduped_requests.store(0, Ordering::Relaxed);
        self.degraded_responses.store(0, Ordering::Relaxed);
        self.avg_response_time_bits.store(0, Ordering::Relaxed);
        self.errors_by_kind.clear();
    }
}
