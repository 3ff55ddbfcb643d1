//! Pattern-based failure classification.
//!
//! Structured error variants classify directly; string-shaped failures go
//! through an explicit ordered list of `(predicate, kind)` rules evaluated
//! top-to-bottom, falling through to `UpstreamUnavailable`. The order
//! matters: more specific patterns (rate limiting) sit above generic ones
//! (connectivity), and the list is the only place matching happens.

use crate::{
    cache::CacheError,
    classify::{ErrorKind, ErrorRecord},
    types::FetchError,
};

/// One classification rule. Predicates receive the lowercased message.
struct Rule {
    kind: ErrorKind,
    matches: fn(&str) -> bool,
}

/// Ordered top-to-bottom; first match wins.
const MESSAGE_RULES: &[Rule] = &[
    Rule {
        kind: ErrorKind::UpstreamTimeout,
        matches: |m| m.contains("timed out") || m.contains("timeout") || m.contains("deadline"),
    },
    Rule {
        kind: ErrorKind::UpstreamRateLimited,
        matches: |m| {
            m.contains("rate limit") ||
                m.contains("too many requests") ||
                m.contains("429") ||
                m.contains("quota exceeded")
        },
    },
    Rule {
        kind: ErrorKind::ConfigurationError,
        matches: |m| {
            m.contains("api key") ||
                m.contains("unauthorized") ||
                m.contains("forbidden") ||
                m.contains("credential") ||
                m.contains("misconfigur")
        },
    },
    Rule {
        kind: ErrorKind::UpstreamInvalidResponse,
        matches: |m| {
            m.contains("parse") ||
                m.contains("malformed") ||
                m.contains("invalid json") ||
                m.contains("unexpected token") ||
                m.contains("decode")
        },
    },
    Rule {
        kind: ErrorKind::SignalExtractionFailed,
        matches: |m| m.contains("extraction") || m.contains("extract signal"),
    },
    Rule {
        kind: ErrorKind::SignalValidationFailed,
        matches: |m| m.contains("validation") || m.contains("invalid signal"),
    },
    Rule {
        kind: ErrorKind::InsufficientData,
        matches: |m| {
            m.contains("insufficient") || m.contains("no results") || m.contains("empty result")
        },
    },
    Rule {
        kind: ErrorKind::CacheError,
        matches: |m| m.contains("cache"),
    },
    Rule {
        kind: ErrorKind::UpstreamUnavailable,
        matches: |m| {
            m.contains("connection") ||
                m.contains("unreachable") ||
                m.contains("refused") ||
                m.contains("dns") ||
                m.contains("unavailable")
        },
    },
];

/// Classifies a bare message through the ordered rule list.
///
/// Total: anything unmatched is `UpstreamUnavailable`.
#[must_use]
pub fn classify_message(message: &str) -> ErrorKind {
    let lowered = message.to_lowercase();
    MESSAGE_RULES
        .iter()
        .find(|rule| (rule.matches)(&lowered))
        .map_or(ErrorKind::UpstreamUnavailable, |rule| rule.kind)
}

/// Classifies a raw fetch failure into an [`ErrorRecord`].
///
/// Structured variants map directly; HTTP statuses split into rate
/// limiting (429), upstream faults (5xx), auth/structural faults (other
/// 4xx), and `Other` strings fall through to the message rules.
#[must_use]
pub fn classify_fetch(error: &FetchError) -> ErrorRecord {
    match error {
        FetchError::Timeout => ErrorRecord::new(ErrorKind::UpstreamTimeout, error.to_string()),
        FetchError::Http { status, message } => {
            let kind = match status {
                429 => ErrorKind::UpstreamRateLimited,
                500..=599 => ErrorKind::UpstreamUnavailable,
                404 => ErrorKind::InsufficientData,
                // Remaining 4xx means the request we built was rejected:
                // structural, fail fast rather than hammer the upstream
                400..=499 => ErrorKind::ConfigurationError,
                _ => classify_message(message),
            };
            ErrorRecord::new(kind, error.to_string()).with_context(format!("http_status={status}"))
        }
        FetchError::Connection(_) => {
            ErrorRecord::new(ErrorKind::UpstreamUnavailable, error.to_string())
        }
        FetchError::RateLimited { retry_after_ms, .. } => {
            let record = ErrorRecord::new(ErrorKind::UpstreamRateLimited, error.to_string());
            match retry_after_ms {
                Some(ms) => record.with_context(format!("retry_after_ms={ms}")),
                None => record,
            }
        }
        FetchError::InvalidBody(_) => {
            ErrorRecord::new(ErrorKind::UpstreamInvalidResponse, error.to_string())
        }
        FetchError::Extraction(_) => {
            ErrorRecord::new(ErrorKind::SignalExtractionFailed, error.to_string())
        }
        FetchError::Validation(_) => {
            ErrorRecord::new(ErrorKind::SignalValidationFailed, error.to_string())
        }
        FetchError::InsufficientData(_) => {
            ErrorRecord::new(ErrorKind::InsufficientData, error.to_string())
        }
        FetchError::Configuration(_) => {
            ErrorRecord::new(ErrorKind::ConfigurationError, error.to_string())
        }
        FetchError::CircuitOpen { scope } => classify_circuit_open(scope),
        FetchError::Other(message) => ErrorRecord::new(classify_message(message), message.clone()),
    }
}

/// Classifies a primary-store failure.
#[must_use]
pub fn classify_cache(error: &CacheError) -> ErrorRecord {
    ErrorRecord::new(ErrorKind::CacheError, error.to_string())
}

/// Classifies a circuit-breaker rejection for the given scope.
///
/// The breaker already owns re-admission timing, so the record is not
/// retryable at the orchestrator level despite the kind's position in
/// the taxonomy.
#[must_use]
pub fn classify_circuit_open(scope: &str) -> ErrorRecord {
    let mut record = ErrorRecord::new(
        ErrorKind::UpstreamUnavailable,
        format!("circuit breaker open for scope '{scope}'"),
    )
    .with_context("circuit_open");
    record.retryable = false;
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{RecommendedAction, Severity};

    #[test]
    fn test_message_rules_first_match_wins() {
        // "request to cache upstream timed out" matches the timeout rule
        // before the cache rule because the list is ordered
        assert_eq!(
            classify_message("request to cache upstream timed out"),
            ErrorKind::UpstreamTimeout
        );
        assert_eq!(classify_message("rate limit exceeded"), ErrorKind::UpstreamRateLimited);
        assert_eq!(classify_message("connection refused"), ErrorKind::UpstreamUnavailable);
        assert_eq!(classify_message("failed to parse body"), ErrorKind::UpstreamInvalidResponse);
        assert_eq!(classify_message("missing api key"), ErrorKind::ConfigurationError);
    }

    #[test]
    fn test_unmatched_message_defaults_to_unavailable() {
        let kind = classify_message("something completely novel happened");
        assert_eq!(kind, ErrorKind::UpstreamUnavailable);
        assert_eq!(kind.severity(), Severity::Medium);
    }

    #[test]
    fn test_classify_is_total_over_structured_variants() {
        let cases = [
            (FetchError::Timeout, ErrorKind::UpstreamTimeout),
            (
                FetchError::Http { status: 503, message: "unavailable".into() },
                ErrorKind::UpstreamUnavailable,
            ),
            (
                FetchError::Http { status: 429, message: "slow down".into() },
                ErrorKind::UpstreamRateLimited,
            ),
            (
                FetchError::Http { status: 401, message: "unauthorized".into() },
                ErrorKind::ConfigurationError,
            ),
            (
                FetchError::Http { status: 404, message: "not found".into() },
                ErrorKind::InsufficientData,
            ),
            (FetchError::Connection("refused".into()), ErrorKind::UpstreamUnavailable),
            (
                FetchError::RateLimited { message: "q".into(), retry_after_ms: Some(500) },
                ErrorKind::UpstreamRateLimited,
            ),
            (FetchError::InvalidBody("bad".into()), ErrorKind::UpstreamInvalidResponse),
            (FetchError::Extraction("e".into()), ErrorKind::SignalExtractionFailed),
            (FetchError::Validation("v".into()), ErrorKind::SignalValidationFailed),
            (FetchError::InsufficientData("i".into()), ErrorKind::InsufficientData),
            (FetchError::Configuration("c".into()), ErrorKind::ConfigurationError),
            (FetchError::CircuitOpen { scope: "music".into() }, ErrorKind::UpstreamUnavailable),
            (FetchError::Other("who knows".into()), ErrorKind::UpstreamUnavailable),
        ];

        for (error, expected) in cases {
            assert_eq!(classify_fetch(&error).kind, expected, "for {error:?}");
        }
    }

    #[test]
    fn test_rate_limit_hint_lands_in_context() {
        let record = classify_fetch(&FetchError::RateLimited {
            message: "quota".into(),
            retry_after_ms: Some(1200),
        });
        assert_eq!(record.context.as_deref(), Some("retry_after_ms=1200"));
    }

    #[test]
    fn test_circuit_open_is_not_retryable() {
        let record = classify_circuit_open("music");
        assert_eq!(record.kind, ErrorKind::UpstreamUnavailable);
        assert!(!record.retryable);
        assert_eq!(record.recommended_action, RecommendedAction::FallbackToCache);
        assert_eq!(record.context.as_deref(), Some("circuit_open"));
    }

    #[test]
    fn test_classify_cache() {
        let record = classify_cache(&CacheError::Serialize("oops".into()));
        assert_eq!(record.kind, ErrorKind::CacheError);
        assert!(record.retryable);
    }
}
