//! Adaptive TTL computation.
//!
//! The orchestrator never caches with a single constant TTL. Each write
//! combines three factors:
//!
//! - **Strategy scale**: the global `cache_strategy` knob. Aggressive
//!   deployments double the base TTL, conservative ones halve it.
//! - **Volatility multiplier**: per entity type. Fast-moving categories
//!   (trend data) get a fraction of the base TTL; stable preference
//!   categories get a multiple.
//! - **Richness multiplier**: larger, denser result sets cost more to
//!   refetch and are safer to keep, so payload size stretches the TTL up
//!   to a fixed cap.
//!
//! The product is clamped to `[min_ttl, max_ttl]`.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

/// Global caching posture, scaling every computed TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// Double TTLs. For deployments that prefer staleness over upstream load.
    Aggressive,
    /// Base TTLs unchanged.
    #[default]
    Balanced,
    /// Halve TTLs. For deployments that prefer freshness.
    Conservative,
}

impl CacheStrategy {
    #[must_use]
    pub fn scale(self) -> f64 {
        match self {
            Self::Aggressive => 2.0,
            Self::Balanced => 1.0,
            Self::Conservative => 0.5,
        }
    }
}

/// Payload size at or below which the richness multiplier is 1.0.
const RICHNESS_FLOOR_BYTES: usize = 1024;
/// Payload size at or above which the richness multiplier hits its cap.
const RICHNESS_CEILING_BYTES: usize = 64 * 1024;
/// Maximum richness multiplier.
const RICHNESS_CAP: f64 = 1.5;

/// Per-write TTL policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlPolicy {
    /// Base TTL in milliseconds before any multiplier.
    pub base_ttl_ms: u64,
    /// Lower clamp for computed TTLs.
    pub min_ttl_ms: u64,
    /// Upper clamp for computed TTLs.
    pub max_ttl_ms: u64,
    /// Global strategy scale.
    pub strategy: CacheStrategy,
    /// Volatility multipliers keyed by lowercase entity type.
    /// Types absent from the map use 1.0.
    pub entity_ttl_multipliers: HashMap<String, f64>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        let mut entity_ttl_multipliers = HashMap::new();
        // Volatile, fast-changing signals
        entity_ttl_multipliers.insert("trending".to_string(), 0.25);
        entity_ttl_multipliers.insert("events".to_string(), 0.5);
        // Stable preference data
        entity_ttl_multipliers.insert("heritage".to_string(), 2.0);
        entity_ttl_multipliers.insert("demographics".to_string(), 2.0);

        Self {
            base_ttl_ms: 5 * 60 * 1000,
            min_ttl_ms: 10 * 1000,
            max_ttl_ms: 60 * 60 * 1000,
            strategy: CacheStrategy::Balanced,
            entity_ttl_multipliers,
        }
    }
}

impl TtlPolicy {
    /// Computes the TTL for a cache write.
    ///
    /// `value_bytes` is the canonical serialized size of the value being
    /// cached, used as the richness signal.
    #[must_use]
    pub fn compute(&self, entity_type: &str, value_bytes: usize) -> Duration {
        let volatility = self
            .entity_ttl_multipliers
            .get(&entity_type.trim().to_lowercase())
            .copied()
            .unwrap_or(1.0);

        let ttl_ms = (self.base_ttl_ms as f64)
            * self.strategy.scale()
            * volatility
            * Self::richness_multiplier(value_bytes);

        let clamped = ttl_ms.clamp(self.min_ttl_ms as f64, self.max_ttl_ms as f64);
        Duration::from_millis(clamped as u64)
    }

    /// Linear ramp from 1.0 at the floor to the cap at the ceiling.
    fn richness_multiplier(value_bytes: usize) -> f64 {
        if value_bytes <= RICHNESS_FLOOR_BYTES {
            return 1.0;
        }
        if value_bytes >= RICHNESS_CEILING_BYTES {
            return RICHNESS_CAP;
        }
        let span = (RICHNESS_CEILING_BYTES - RICHNESS_FLOOR_BYTES) as f64;
        let progress = (value_bytes - RICHNESS_FLOOR_BYTES) as f64 / span;
        1.0 + progress * (RICHNESS_CAP - 1.0)
    }
}
