//! Shared types for the gateway core.
//!
//! Everything callers hand to [`optimized_request`] lives here: parameter
//! values, scheduling hints, per-request options, and the raw upstream
//! failure type produced by injected fetch closures.
//!
//! [`optimized_request`]: crate::optimizer::RequestOptimizer::optimized_request

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};
use thiserror::Error;

/// A single request parameter value: a scalar or a list of scalars.
///
/// List element order is semantic (e.g. ranked seed entities) and is
/// preserved by key normalization; only parameter *names* are reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// String scalar. Case is preserved in the canonical key.
    Str(String),
    /// Integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// Boolean scalar.
    Bool(bool),
    /// Ordered list of string elements.
    List(Vec<String>),
}

impl ParamValue {
    /// Renders the value into its canonical key form.
    ///
    /// Empty strings and empty lists render to the empty string, which the
    /// key normalizer treats the same as an absent parameter.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Str(s) => s.trim().to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => {
                // Integral floats render without the fractional part so that
                // `3.0` and `3` normalize to the same key.
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{}", *f as i64)
                } else {
                    f.to_string()
                }
            }
            Self::Bool(b) => b.to_string(),
            Self::List(items) => items
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}

/// Request parameters as supplied by callers. Never mutated by the core.
pub type Params = HashMap<String, ParamValue>;

/// Scheduling hint for admission under concurrency limits.
///
/// Higher priority is serviced first when requests queue for permits;
/// ties break by arrival order so background work is never starved
/// indefinitely by equal-priority peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Prefetch, warmup, and other deferrable work.
    Background,
    /// Default for ordinary requests.
    #[default]
    Normal,
    /// User-facing requests where latency is directly visible.
    Interactive,
}

impl Priority {
    /// Numeric score used by the admission queue (higher wins).
    #[must_use]
    pub fn score(self) -> u8 {
        match self {
            Self::Background => 0,
            Self::Normal => 1,
            Self::Interactive => 2,
        }
    }
}

/// Per-request options for [`optimized_request`].
///
/// [`optimized_request`]: crate::optimizer::RequestOptimizer::optimized_request
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Scheduling hint for the admission queue.
    pub priority: Priority,
    /// Upstream call timeout. Falls back to the configured default.
    pub timeout: Option<Duration>,
    /// Skip the primary cache read. The request still deduplicates and
    /// the result is still written back.
    pub skip_cache: bool,
    /// Caller-supplied degraded value returned when every recovery
    /// strategy fails.
    pub fallback_value: Option<serde_json::Value>,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    #[must_use]
    pub fn with_fallback_value(mut self, value: serde_json::Value) -> Self {
        self.fallback_value = Some(value);
        self
    }
}

/// Raw failure produced by an injected fetch closure or by the transport
/// wrapper around it.
///
/// The core never interprets these directly; they are normalized into the
/// closed [`ErrorKind`] taxonomy by the classifier before any retry,
/// breaker, or metrics decision is made.
///
/// Variants are `Clone` because deduplicated followers all receive the
/// leader's exact outcome.
///
/// [`ErrorKind`]: crate::classify::ErrorKind
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// Upstream call exceeded its timeout budget.
    #[error("request timed out")]
    Timeout,

    /// HTTP-level error (non-2xx status) from the upstream.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection could not be established or was dropped.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Upstream signalled rate limiting, optionally with its own cool-down.
    #[error("rate limited: {message}")]
    RateLimited { message: String, retry_after_ms: Option<u64> },

    /// Response arrived but could not be parsed or was structurally invalid.
    #[error("invalid response body: {0}")]
    InvalidBody(String),

    /// Recommendation signals could not be extracted from a valid response.
    #[error("signal extraction failed: {0}")]
    Extraction(String),

    /// Extracted signals failed validation rules.
    #[error("signal validation failed: {0}")]
    Validation(String),

    /// Upstream answered but the result set is too sparse to be useful.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Request could not be built due to bad configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Call short-circuited by an open circuit breaker. Produced by the
    /// gateway pipeline, never by fetch closures.
    #[error("circuit breaker open for scope '{scope}'")]
    CircuitOpen { scope: String },

    /// Anything else. Classified by message content.
    #[error("{0}")]
    Other(String),
}

/// Boxed future returned by an injected fetch closure.
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, FetchError>> + Send>>;

/// Injected single-item transport closure.
///
/// The core knows nothing about the wire protocol: it sees only the
/// success value, the failure, and how long the call took.
pub type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_value_render_scalars() {
        assert_eq!(ParamValue::Str("  Jazz ".into()).render(), "Jazz");
        assert_eq!(ParamValue::Int(42).render(), "42");
        assert_eq!(ParamValue::Float(3.0).render(), "3");
        assert_eq!(ParamValue::Float(2.5).render(), "2.5");
        assert_eq!(ParamValue::Bool(true).render(), "true");
    }

    #[test]
    fn test_param_value_render_lists() {
        let v = ParamValue::List(vec!["a".into(), " b ".into(), String::new()]);
        assert_eq!(v.render(), "a,b");

        // Empty list renders empty, same as an empty string scalar
        assert_eq!(ParamValue::List(vec![]).render(), "");
        assert_eq!(ParamValue::Str(String::new()).render(), "");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Interactive.score() > Priority::Normal.score());
        assert!(Priority::Normal.score() > Priority::Background.score());
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_request_options_builder() {
        let opts = RequestOptions::new()
            .with_priority(Priority::Interactive)
            .with_timeout(Duration::from_secs(5))
            .skip_cache()
            .with_fallback_value(serde_json::json!(["A", "B"]));

        assert_eq!(opts.priority, Priority::Interactive);
        assert_eq!(opts.timeout, Some(Duration::from_secs(5)));
        assert!(opts.skip_cache);
        assert!(opts.fallback_value.is_some());
    }
}
