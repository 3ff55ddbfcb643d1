//! Failure containment: circuit breaking and retry policy.
//!
//! The breaker decides whether an upstream scope may be called at all;
//! the retry manager decides whether a specific failed call is worth
//! repeating and how long to wait. Both consult the classified
//! [`ErrorKind`](crate::classify::ErrorKind) taxonomy rather than raw
//! errors, so a new failure mode only needs classifying once.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use retry::{RetryDecision, RetryManager, RetryPolicy};
