//! Retry decisions with exponential backoff.
//!
//! The manager is a pure decision function: the orchestrator owns the
//! actual loop and sleeps, keeping retries strictly sequential (no
//! parallel fan-out against a struggling upstream). Only kinds flagged
//! retryable in the taxonomy are ever retried; a hard `max_retries` bound
//! guarantees termination, after which `fallback_recommended` tells the
//! orchestrator to stop looping and start degrading.

use crate::classify::ErrorKind;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

/// Backoff policy: `delay = min(initial * multiplier^(attempt-1), max)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Exponential growth factor.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, initial_delay_ms: 200, backoff_multiplier: 2.0, max_delay_ms: 5000 }
    }
}

impl RetryPolicy {
    /// Backoff delay for the given 1-based retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        Duration::from_millis((raw as u64).min(self.max_delay_ms))
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether to attempt the call again.
    pub retry: bool,
    /// How long to wait first (zero when `retry` is false).
    pub delay: Duration,
    /// Set when a retryable kind has exhausted its budget: stop looping
    /// and move to the recovery chain.
    pub fallback_recommended: bool,
}

impl RetryDecision {
    fn no_retry(fallback_recommended: bool) -> Self {
        Self { retry: false, delay: Duration::ZERO, fallback_recommended }
    }
}

/// Computes whether and when to retry a classified failure.
///
/// Carries a base policy plus per-kind overrides. Rate-limit errors ship
/// with a larger initial delay and a gentler multiplier since the
/// upstream signals its own cool-down; cache I/O errors retry fast and
/// briefly.
#[derive(Debug, Clone)]
pub struct RetryManager {
    base: RetryPolicy,
    overrides: HashMap<ErrorKind, RetryPolicy>,
}

impl RetryManager {
    /// Creates a manager with the given base policy and the standard
    /// per-kind overrides.
    #[must_use]
    pub fn new(base: RetryPolicy) -> Self {
        let mut overrides = HashMap::new();
        overrides.insert(
            ErrorKind::UpstreamRateLimited,
            RetryPolicy {
                max_retries: 2,
                initial_delay_ms: 1000,
                backoff_multiplier: 1.5,
                max_delay_ms: 10_000,
            },
        );
        overrides.insert(
            ErrorKind::CacheError,
            RetryPolicy {
                max_retries: 2,
                initial_delay_ms: 50,
                backoff_multiplier: 2.0,
                max_delay_ms: 500,
            },
        );
        Self { base, overrides }
    }

    /// Replaces the override for one kind.
    #[must_use]
    pub fn with_override(mut self, kind: ErrorKind, policy: RetryPolicy) -> Self {
        self.overrides.insert(kind, policy);
        self
    }

    /// Policy in effect for a kind.
    #[must_use]
    pub fn policy_for(&self, kind: ErrorKind) -> &RetryPolicy {
        self.overrides.get(&kind).unwrap_or(&self.base)
    }

    /// Decides whether attempt number `attempt` (1-based, counting
    /// failures so far) should be retried.
    ///
    /// `retry_after_hint` is an upstream-provided cool-down (rate-limit
    /// responses); when present it takes precedence over the computed
    /// backoff if longer.
    #[must_use]
    pub fn should_retry(
        &self,
        kind: ErrorKind,
        attempt: u32,
        retry_after_hint: Option<Duration>,
    ) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::no_retry(false);
        }

        let policy = self.policy_for(kind);
        if attempt > policy.max_retries {
            return RetryDecision::no_retry(true);
        }

        let mut delay = policy.delay_for_attempt(attempt);
        if let Some(hint) = retry_after_hint {
            delay = delay.max(hint.min(Duration::from_millis(policy.max_delay_ms)));
        }

        RetryDecision { retry: true, delay, fallback_recommended: false }
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
