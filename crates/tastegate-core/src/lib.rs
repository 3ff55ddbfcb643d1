//! # Tastegate Core
//!
//! Core library for the Tastegate resilient gateway to cultural
//! taste-recommendation APIs.
//!
//! This crate provides the foundational components for:
//!
//! - **[`cache`]**: Tiered caching with deterministic key normalization,
//!   adaptive TTL computation, LRU + byte-ceiling eviction, and a
//!   long-lived fallback tier for degraded responses.
//!
//! - **[`classify`]**: A closed failure taxonomy. Every raw error is
//!   normalized to one [`ErrorKind`](classify::ErrorKind) carrying fixed
//!   severity, retryability, and a recommended recovery action.
//!
//! - **[`resilience`]**: Per-scope circuit breakers with single-probe
//!   half-open recovery, and exponential-backoff retry decisions with
//!   per-kind policy overrides.
//!
//! - **[`coordinator`]**: In-flight request deduplication, priority-aware
//!   concurrency admission, and optional same-entity-type batching.
//!
//! - **[`optimizer`]**: The `optimized_request` orchestrator tying the
//!   stages together, plus the builder and runtime config updates.
//!
//! - **[`metrics`]**: Rolling statistics (hit rates, latency EWMA, error
//!   breakdown, breaker states) mirrored to the `metrics` facade.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       RequestOptimizer                        │
//! │  ┌──────────────┐  ┌────────────────────┐  ┌───────────────┐  │
//! │  │  CacheStore  │  │ RequestCoordinator │  │    Metrics    │  │
//! │  │ FallbackStore│  │   AdmissionQueue   │  │   Collector   │  │
//! │  └──────┬───────┘  │      Batcher       │  └───────┬───────┘  │
//! │         │          └─────────┬──────────┘          │          │
//! │  ┌──────▼───────┐  ┌─────────▼──────────┐  ┌───────▼───────┐  │
//! │  │  TtlPolicy   │  │  BreakerRegistry   │  │ GatewayStats  │  │
//! │  │  RequestKey  │  │   RetryManager     │  │   snapshot    │  │
//! │  └──────────────┘  └────────────────────┘  └───────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Request Flow
//!
//! ```text
//! optimized_request(entity, params, fetch, options)
//!       │
//!       ▼
//! ┌─────────────┐
//! │  Normalize  │  canonical key: lowercase(entity)?name=value&...
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │ Cache Check │ ─── Hit ──► Cached Response (from_cache)
//! └──────┬──────┘
//!        │ Miss
//!        ▼
//! ┌─────────────┐
//! │   Dedupe    │ ─── In flight ──► Await shared outcome
//! └──────┬──────┘
//!        │ Leader
//!        ▼
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────────┐
//! │  Admission  │ ──► │   Breaker   │ ──► │ Fetch + Retries  │
//! │   Permit    │     │    Gate     │     │ (classified)     │
//! └─────────────┘     └─────────────┘     └────────┬─────────┘
//!                                                  │
//!                           Success ◄──────────────┴──► Terminal failure
//!                              │                              │
//!                   ┌──────────▼──────────┐       ┌───────────▼──────────┐
//!                   │ Adaptive-TTL write  │       │ Recovery chain:      │
//!                   │ (generation-guarded)│       │ fallback value/store │
//!                   └─────────────────────┘       └──────────────────────┘
//! ```

pub mod cache;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod metrics;
pub mod optimizer;
pub mod resilience;
pub mod types;

pub use config::{ConfigUpdate, GatewayConfig};
pub use metrics::GatewayStats;
pub use optimizer::{GatewayBuilder, GatewayError, OptimizationResult, RequestOptimizer};
pub use types::{FetchError, FetchFn, FetchFuture, ParamValue, Params, Priority, RequestOptions};
