//! Circuit breaker for protecting struggling upstream scopes.
//!
//! One breaker per upstream-dependency class (entity type), so failures
//! in one category never block unrelated categories. Uses a three-state
//! model (`Closed`, `Open`, `HalfOpen`); the Open → HalfOpen transition is
//! lazy (checked on the next call attempt, no timer task), and HalfOpen
//! admits exactly one probe call — concurrent callers are rejected until
//! the probe settles.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::Instant};
use tracing::{info, warn};

/// Circuit breaker state machine.
///
/// - `Closed` -> `Open`: consecutive failures reach the threshold
/// - `Open` -> `HalfOpen`: cooldown elapsed and a call is attempted
/// - `HalfOpen` -> `Closed`: probe success (failure count reset)
/// - `HalfOpen` -> `Open`: probe failure (cooldown re-armed, no growth)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls allowed, failures counted.
    Closed,
    /// Calls short-circuited without touching the upstream.
    Open,
    /// Cooldown elapsed; a single probe decides the next state.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Mutable state under a single lock so transitions are atomic.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    /// Set while the single HalfOpen probe is outstanding.
    probe_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_probe_at: None,
            probe_in_flight: false,
        }
    }
}

/// Serializable point-in-time view for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds until the next probe is admitted; `None` unless Open.
    pub probe_in_ms: Option<u64>,
}

/// Per-scope circuit breaker.
///
/// All mutable state sits behind one `RwLock` so state transitions are
/// atomic. The common Closed case is served with a read lock; a write
/// lock is taken only when a transition may be needed (double-checked
/// after acquisition, since another task may have transitioned first).
pub struct CircuitBreaker {
    inner: RwLock<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Creates a breaker opening after `threshold` consecutive failures
    /// and probing again after `cooldown`.
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self { inner: RwLock::new(BreakerInner::new()), threshold: threshold.max(1), cooldown }
    }

    /// Decides whether a call may proceed right now.
    ///
    /// Returns `false` while Open (before the cooldown) and while a
    /// HalfOpen probe is already outstanding. Returns `true` for Closed,
    /// and for exactly one caller when the cooldown has elapsed (that
    /// caller becomes the probe).
    pub async fn try_acquire(&self) -> bool {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitState::Closed => return true,
                CircuitState::HalfOpen if inner.probe_in_flight => return false,
                CircuitState::Open => {
                    match inner.next_probe_at {
                        Some(at) if Instant::now() >= at => {} // fall through to write path
                        _ => return false,
                    }
                }
                CircuitState::HalfOpen => {} // probe slot free, claim under write lock
            }
        }

        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => match inner.next_probe_at {
                Some(at) if Instant::now() >= at => {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    warn!("circuit breaker half-open, admitting probe");
                    true
                }
                _ => false,
            },
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful call. Closes the circuit from HalfOpen and
    /// resets the consecutive failure count.
    pub async fn on_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                info!("circuit breaker closed after successful probe");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.next_probe_at = None;
                inner.probe_in_flight = false;
            }
        }
    }

    /// Records a failed call.
    ///
    /// In Closed, trips to Open once the threshold is reached. In
    /// HalfOpen, the failed probe re-arms the cooldown; backoff growth is
    /// the retry manager's concern, not the breaker's.
    pub async fn on_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.threshold {
                    let now = Instant::now();
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.next_probe_at = Some(now + self.cooldown);
                    warn!(
                        threshold = self.threshold,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.next_probe_at = Some(Instant::now() + self.cooldown);
                inner.probe_in_flight = false;
                warn!("circuit breaker probe failed, re-opening");
            }
            CircuitState::Open => {}
        }
    }

    /// Returns the current state without transitioning.
    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// Returns the current consecutive failure count.
    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.read().await.consecutive_failures
    }

    /// Builds a serializable snapshot.
    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.read().await;
        let probe_in_ms = match (inner.state, inner.next_probe_at) {
            (CircuitState::Open, Some(at)) => {
                Some(at.saturating_duration_since(Instant::now()).as_millis() as u64)
            }
            _ => None,
        };
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            probe_in_ms,
        }
    }
}

/// Lazily-populated registry of one breaker per scope.
///
/// Threshold and cooldown are captured at first use of a scope; config
/// updates apply to scopes created afterwards.
pub struct BreakerRegistry {
    breakers: DashMap<Arc<str>, Arc<CircuitBreaker>, ahash::RandomState>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { breakers: DashMap::with_hasher(ahash::RandomState::new()) }
    }

    /// Returns the breaker for `scope`, creating it on first use.
    #[must_use]
    pub fn for_scope(&self, scope: &str, threshold: u32, cooldown: Duration) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(scope) {
            return Arc::clone(&existing);
        }
        self.breakers
            .entry(Arc::from(scope))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(threshold, cooldown)))
            .clone()
    }

    /// Snapshots every known scope for `get_stats()`.
    pub async fn snapshot(&self) -> HashMap<String, BreakerSnapshot> {
        let scopes: Vec<(String, Arc<CircuitBreaker>)> = self
            .breakers
            .iter()
            .map(|e| (e.key().to_string(), Arc::clone(e.value())))
            .collect();

        let mut out = HashMap::with_capacity(scopes.len());
        for (scope, breaker) in scopes {
            out.insert(scope, breaker.snapshot().await);
        }
        out
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trips_open_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));

        for i in 0..2 {
            breaker.on_failure().await;
            assert_eq!(breaker.state().await, CircuitState::Closed);
            assert_eq!(breaker.consecutive_failures().await, i + 1);
            assert!(breaker.try_acquire().await);
        }

        breaker.on_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.on_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;

        // First caller becomes the probe, second is rejected
        assert!(breaker.try_acquire().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        assert!(!breaker.try_acquire().await);

        breaker.on_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures().await, 0);
        assert!(breaker.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_rearms_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.on_failure().await;

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.try_acquire().await);

        breaker.on_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.try_acquire().await);

        // Full cooldown again before the next probe
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!breaker.try_acquire().await);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(breaker.try_acquire().await);
    }

    #[tokio::test]
    async fn test_success_in_closed_resets_failures() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        breaker.on_failure().await;
        breaker.on_failure().await;
        breaker.on_success().await;
        assert_eq!(breaker.consecutive_failures().await, 0);

        for _ in 0..4 {
            breaker.on_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_registry_scopes_are_independent() {
        let registry = BreakerRegistry::new();
        let music = registry.for_scope("music", 1, Duration::from_secs(30));
        let film = registry.for_scope("film", 1, Duration::from_secs(30));

        music.on_failure().await;
        assert_eq!(music.state().await, CircuitState::Open);
        assert_eq!(film.state().await, CircuitState::Closed);
        assert!(film.try_acquire().await);

        // Same scope returns the same breaker
        let music_again = registry.for_scope("music", 1, Duration::from_secs(30));
        assert_eq!(music_again.state().await, CircuitState::Open);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot["music"].state, CircuitState::Open);
        assert_eq!(snapshot["film"].state, CircuitState::Closed);
    }
}
