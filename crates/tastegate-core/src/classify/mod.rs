//! Failure taxonomy and classification.
//!
//! Every raw failure in the gateway — network timeout, non-2xx status,
//! parse failure, store exhaustion, breaker rejection — is normalized to
//! exactly one [`ErrorKind`] before any retry, breaker, or metrics
//! decision is made. The taxonomy is the single source of truth: the
//! retry manager consults `retryable`, the orchestrator consults
//! `recommended_action`, and metrics label by `as_str`.
//!
//! Classification must be total and must never itself fail; anything
//! unmatched defaults to [`ErrorKind::UpstreamUnavailable`].

mod classifier;

pub use classifier::{classify_cache, classify_circuit_open, classify_fetch, classify_message};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of normalized failure kinds.
///
/// Each kind carries a fixed [`Severity`], a fixed `retryable` flag, and a
/// fixed default [`RecommendedAction`]. Adding a kind means deciding all
/// three; nothing downstream special-cases individual kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Upstream unreachable, erroring, or short-circuited. The default
    /// for anything unmatched.
    UpstreamUnavailable,
    /// Upstream call exceeded its timeout budget.
    UpstreamTimeout,
    /// Upstream signalled rate limiting.
    UpstreamRateLimited,
    /// Upstream answered with a malformed or contract-violating body.
    UpstreamInvalidResponse,
    /// Signals could not be extracted from an otherwise valid response.
    SignalExtractionFailed,
    /// Extracted signals failed validation rules.
    SignalValidationFailed,
    /// Result set too sparse to be useful.
    InsufficientData,
    /// Primary cache read/write failure (corruption, memory ceiling).
    CacheError,
    /// Structural misconfiguration. Fails fast; never degraded around.
    ConfigurationError,
}

/// Fixed severity per error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What the orchestrator should do about a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Retry locally under the retry manager's policy.
    Retry,
    /// Serve from the fallback store if a live entry exists.
    FallbackToCache,
    /// Substitute caller-supplied or category-default degraded data.
    FallbackToDegraded,
    /// Fail the request; no recovery is appropriate.
    Fail,
}

impl ErrorKind {
    /// Fixed severity for this kind.
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::UpstreamUnavailable => Severity::Medium,
            Self::UpstreamTimeout => Severity::Medium,
            Self::UpstreamRateLimited => Severity::Low,
            Self::UpstreamInvalidResponse => Severity::High,
            Self::SignalExtractionFailed => Severity::Medium,
            Self::SignalValidationFailed => Severity::Medium,
            Self::InsufficientData => Severity::Low,
            Self::CacheError => Severity::Medium,
            Self::ConfigurationError => Severity::Critical,
        }
    }

    /// Whether the retry manager may retry this kind at all.
    ///
    /// Transient kinds only: timeouts, rate limits, and cache I/O. Data
    /// quality and structural kinds never benefit from a local retry.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::UpstreamTimeout | Self::UpstreamRateLimited | Self::CacheError)
    }

    /// Fixed default recovery action for this kind.
    #[must_use]
    pub fn recommended_action(self) -> RecommendedAction {
        match self {
            Self::UpstreamTimeout | Self::UpstreamRateLimited | Self::CacheError => {
                RecommendedAction::Retry
            }
            Self::UpstreamUnavailable | Self::UpstreamInvalidResponse => {
                RecommendedAction::FallbackToCache
            }
            Self::SignalExtractionFailed |
            Self::SignalValidationFailed |
            Self::InsufficientData => RecommendedAction::FallbackToDegraded,
            Self::ConfigurationError => RecommendedAction::Fail,
        }
    }

    /// Whether repeated failures of this kind should trip the breaker.
    ///
    /// Data-quality kinds describe the payload, not upstream health, and
    /// must not open the circuit for unrelated requests.
    #[must_use]
    pub fn should_trip_breaker(self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable |
                Self::UpstreamTimeout |
                Self::UpstreamInvalidResponse |
                Self::UpstreamRateLimited
        )
    }

    /// Static label for metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamRateLimited => "upstream_rate_limited",
            Self::UpstreamInvalidResponse => "upstream_invalid_response",
            Self::SignalExtractionFailed => "signal_extraction_failed",
            Self::SignalValidationFailed => "signal_validation_failed",
            Self::InsufficientData => "insufficient_data",
            Self::CacheError => "cache_error",
            Self::ConfigurationError => "configuration_error",
        }
    }
}

/// A classified failure, produced once per raw error.
///
/// Consumed immediately by the recovery pipeline and aggregated into
/// rolling metrics; also returned to callers in
/// [`OptimizationResult::errors`](crate::optimizer::OptimizationResult)
/// so UI code can badge degraded responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub retryable: bool,
    pub recommended_action: RecommendedAction,
    pub occurred_at: DateTime<Utc>,
    /// Free-form origin detail (scope name, retry-after hint, store op).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ErrorRecord {
    /// Builds a record for `kind` with the taxonomy's fixed attributes.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            message: message.into(),
            retryable: kind.is_retryable(),
            recommended_action: kind.recommended_action(),
            occurred_at: Utc::now(),
            context: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds_are_exactly_the_transient_set() {
        let retryable: Vec<ErrorKind> = [
            ErrorKind::UpstreamUnavailable,
            ErrorKind::UpstreamTimeout,
            ErrorKind::UpstreamRateLimited,
            ErrorKind::UpstreamInvalidResponse,
            ErrorKind::SignalExtractionFailed,
            ErrorKind::SignalValidationFailed,
            ErrorKind::InsufficientData,
            ErrorKind::CacheError,
            ErrorKind::ConfigurationError,
        ]
        .into_iter()
        .filter(|k| k.is_retryable())
        .collect();

        assert_eq!(
            retryable,
            vec![ErrorKind::UpstreamTimeout, ErrorKind::UpstreamRateLimited, ErrorKind::CacheError]
        );
    }

    #[test]
    fn test_configuration_errors_fail_fast() {
        let kind = ErrorKind::ConfigurationError;
        assert_eq!(kind.severity(), Severity::Critical);
        assert!(!kind.is_retryable());
        assert_eq!(kind.recommended_action(), RecommendedAction::Fail);
        assert!(!kind.should_trip_breaker());
    }

    #[test]
    fn test_data_quality_kinds_degrade_not_trip() {
        for kind in [
            ErrorKind::InsufficientData,
            ErrorKind::SignalExtractionFailed,
            ErrorKind::SignalValidationFailed,
        ] {
            assert_eq!(kind.recommended_action(), RecommendedAction::FallbackToDegraded);
            assert!(!kind.should_trip_breaker());
        }
    }

    #[test]
    fn test_record_carries_fixed_attributes() {
        let record = ErrorRecord::new(ErrorKind::UpstreamRateLimited, "slow down")
            .with_context("retry_after_ms=1200");

        assert_eq!(record.severity, Severity::Low);
        assert!(record.retryable);
        assert_eq!(record.recommended_action, RecommendedAction::Retry);
        assert_eq!(record.context.as_deref(), Some("retry_after_ms=1200"));
    }
}
