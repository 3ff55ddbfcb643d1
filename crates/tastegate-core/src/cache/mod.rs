//! Tiered caching for upstream recommendation responses.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     RequestOptimizer                       │
//! │   (sole writer of both stores; computes TTL per write)     │
//! └────────────────────────────────────────────────────────────┘
//!          │                     │                    │
//!  ┌───────▼───────┐     ┌───────▼───────┐    ┌───────▼───────┐
//!  │  RequestKey   │     │  CacheStore   │    │ FallbackStore │
//!  │ normalization │     │  (primary)    │    │  (degraded)   │
//!  │               │     │ • TTL + LRU   │    │ • looser TTL  │
//!  │ • sorted,     │     │ • byte ceiling│    │ • best-effort │
//!  │   lowercased  │     │ • hit/miss    │    │ • read only on│
//!  │   canonical   │     │   accounting  │    │   failure     │
//!  └───────────────┘     └───────────────┘    └───────────────┘
//! ```
//!
//! # Error Handling Conventions
//!
//! - **`Option<T>`**: cache miss (expected, not an error).
//! - **`Result<Option<T>, CacheError>`**: lookups that can also fail —
//!   corruption surfaces as `CacheError::Corrupt` so the recovery
//!   pipeline can act instead of silently serving nothing.
//! - The fallback store never errors: degraded reads are best-effort by
//!   definition.
//!
//! # TTL
//!
//! TTLs are computed per write by [`ttl::TtlPolicy`]: a strategy scale, a
//! per-entity-type volatility multiplier, and a payload-richness
//! multiplier, clamped to configured bounds. Stable preference categories
//! cache far longer than volatile trend signals.

pub mod fallback;
pub mod key;
pub mod store;
pub mod ttl;

pub use fallback::FallbackStore;
pub use key::RequestKey;
pub use store::{CacheError, CacheStore, CacheStoreConfig, CacheStoreStats};
pub use ttl::{CacheStrategy, TtlPolicy};
