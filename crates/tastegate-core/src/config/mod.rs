//! Gateway configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: Hardcoded in struct `Default` implementations
//! 2. **Config file**: TOML file specified by `TASTEGATE_CONFIG` env var
//! 3. **Environment variables**: `TASTEGATE__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`LimitsConfig`]: concurrency and timeout budgets
//! - [`CacheConfig`]: store sizing, TTL policy, and fallback-tier settings
//! - [`BreakerConfig`]: circuit breaker threshold and cooldown
//! - [`RetryPolicy`]: exponential backoff parameters
//! - [`CoordinatorConfig`]: deduplication, batching, and priority settings
//! - [`LoggingConfig`]: log level and format
//!
//! # Validation
//!
//! Configuration is validated at load time. Invalid configurations (e.g.
//! zero cache sizes, a min TTL above the max) return errors rather than
//! failing silently.
//!
//! # Example
//!
//! ```toml
//! [limits]
//! max_concurrent_requests = 8
//! request_timeout_ms = 10000
//!
//! [cache]
//! strategy = "aggressive"
//! base_ttl_ms = 300000
//!
//! [breaker]
//! threshold = 5
//! cooldown_ms = 30000
//! ```

use crate::{
    cache::{CacheStoreConfig, CacheStrategy, TtlPolicy},
    resilience::RetryPolicy,
};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, time::Duration};

/// Concurrency and timeout budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of upstream calls executing at once. Defaults to `8`.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Default per-request upstream timeout in milliseconds. Defaults to `10000`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long a request may queue for an admission permit, in
    /// milliseconds. Defaults to `5000`.
    #[serde(default = "default_admission_wait_ms")]
    pub admission_wait_ms: u64,
}

fn default_max_concurrent_requests() -> usize {
    8
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_admission_wait_ms() -> u64 {
    5_000
}

/// Cache sizing, TTL policy, and fallback-tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Global caching posture scaling every computed TTL. Defaults to `balanced`.
    #[serde(default)]
    pub strategy: CacheStrategy,

    /// Base TTL in milliseconds before any multiplier. Defaults to `300000` (5 min).
    #[serde(default = "default_base_ttl_ms")]
    pub base_ttl_ms: u64,

    /// Lower clamp for computed TTLs. Defaults to `10000`.
    #[serde(default = "default_min_ttl_ms")]
    pub min_ttl_ms: u64,

    /// Upper clamp for computed TTLs. Defaults to `3600000` (1 hour).
    #[serde(default = "default_max_ttl_ms")]
    pub max_ttl_ms: u64,

    /// Maximum primary-store entries before LRU eviction. Defaults to `10000`.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Hard ceiling on primary-store bytes. Defaults to 64 MiB.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// TTL for fallback-tier entries in milliseconds. Much longer than the
    /// primary TTL: stale data beats no data during outages. Defaults to
    /// `86400000` (24 hours).
    #[serde(default = "default_fallback_ttl_ms")]
    pub fallback_ttl_ms: u64,

    /// Soft entry cap on the fallback tier. Defaults to `2000`.
    #[serde(default = "default_fallback_soft_capacity")]
    pub fallback_soft_capacity: usize,

    /// Volatility multipliers keyed by lowercase entity type. Empty means
    /// use the built-in defaults.
    #[serde(default)]
    pub entity_ttl_multipliers: HashMap<String, f64>,
}

fn default_base_ttl_ms() -> u64 {
    300_000
}

fn default_min_ttl_ms() -> u64 {
    10_000
}

fn default_max_ttl_ms() -> u64 {
    3_600_000
}

fn default_max_entries() -> usize {
    10_000
}

fn default_max_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_fallback_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_fallback_soft_capacity() -> usize {
    2_000
}

/// Circuit breaker settings, applied per upstream scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before opening the circuit. Defaults to `5`.
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,

    /// Milliseconds to wait before admitting a probe call. Defaults to `30000`.
    #[serde(default = "default_breaker_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

/// Deduplication, batching, and priority settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Whether same-entity-type requests are coalesced into multi-item
    /// upstream calls. Defaults to `true`.
    #[serde(default = "default_true")]
    pub batching_enabled: bool,

    /// Coalescing window in milliseconds. Defaults to `25`.
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Maximum requests per batch before an early flush. Defaults to `16`.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Whether the admission queue orders waiters by priority. When
    /// disabled every request is admitted with the same score. Defaults
    /// to `true`.
    #[serde(default = "default_true")]
    pub priority_enabled: bool,

    /// Age in milliseconds after which an in-flight entry is presumed
    /// wedged and replaced. Defaults to `30000`.
    #[serde(default = "default_inflight_stale_after_ms")]
    pub inflight_stale_after_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_batch_window_ms() -> u64 {
    25
}

fn default_max_batch_size() -> usize {
    16
}

fn default_inflight_stale_after_ms() -> u64 {
    30_000
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g. "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Root gateway configuration containing all subsystem settings.
///
/// Loaded from TOML files and environment variables. Environment
/// overrides use the `TASTEGATE` prefix with `__` as a separator
/// (e.g. `TASTEGATE__BREAKER__THRESHOLD=3`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// Concurrency and timeout budgets.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Cache sizing and TTL policy.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Circuit breaker settings.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Retry backoff settings.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Deduplication, batching, and priority settings.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout_ms: default_request_timeout_ms(),
            admission_wait_ms: default_admission_wait_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::Balanced,
            base_ttl_ms: default_base_ttl_ms(),
            min_ttl_ms: default_min_ttl_ms(),
            max_ttl_ms: default_max_ttl_ms(),
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            fallback_ttl_ms: default_fallback_ttl_ms(),
            fallback_soft_capacity: default_fallback_soft_capacity(),
            entity_ttl_multipliers: HashMap::new(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { threshold: default_breaker_threshold(), cooldown_ms: default_breaker_cooldown_ms() }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batching_enabled: true,
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            priority_enabled: true,
            inflight_stale_after_ms: default_inflight_stale_after_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

impl GatewayConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables with the `TASTEGATE__` prefix can override any
    /// configuration value, using `__` as a separator for nested fields
    /// (e.g. `TASTEGATE__LIMITS__REQUEST_TIMEOUT_MS=5000`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or
    /// deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("TASTEGATE").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Loads configuration from `config/tastegate.toml` with fallback to
    /// defaults.
    ///
    /// The config file path can be overridden using the `TASTEGATE_CONFIG`
    /// environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("TASTEGATE_CONFIG")
            .unwrap_or_else(|_| "config/tastegate.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.limits.max_concurrent_requests == 0 {
            return Err("Max concurrent requests must be greater than 0".to_string());
        }
        if self.limits.request_timeout_ms == 0 {
            return Err("Request timeout must be greater than 0".to_string());
        }
        if self.cache.max_entries == 0 {
            return Err("Cache max entries must be greater than 0".to_string());
        }
        if self.cache.max_bytes == 0 {
            return Err("Cache max bytes must be greater than 0".to_string());
        }
        if self.cache.min_ttl_ms > self.cache.max_ttl_ms {
            return Err("Cache min TTL must not exceed max TTL".to_string());
        }
        if self.breaker.threshold == 0 {
            return Err("Breaker threshold must be greater than 0".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err("Retry backoff multiplier must be at least 1.0".to_string());
        }
        if self.coordinator.max_batch_size == 0 {
            return Err("Max batch size must be greater than 0".to_string());
        }
        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }
        Ok(())
    }

    /// Builds the TTL policy from the cache section.
    ///
    /// An empty `entity_ttl_multipliers` table keeps the built-in defaults.
    #[must_use]
    pub fn ttl_policy(&self) -> TtlPolicy {
        let defaults = TtlPolicy::default();
        TtlPolicy {
            base_ttl_ms: self.cache.base_ttl_ms,
            min_ttl_ms: self.cache.min_ttl_ms,
            max_ttl_ms: self.cache.max_ttl_ms,
            strategy: self.cache.strategy,
            entity_ttl_multipliers: if self.cache.entity_ttl_multipliers.is_empty() {
                defaults.entity_ttl_multipliers
            } else {
                self.cache.entity_ttl_multipliers.clone()
            },
        }
    }

    /// Builds the primary store sizing from the cache section.
    #[must_use]
    pub fn store_config(&self) -> CacheStoreConfig {
        CacheStoreConfig { max_entries: self.cache.max_entries, max_bytes: self.cache.max_bytes }
    }

    /// Returns the default upstream timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.request_timeout_ms)
    }

    /// Returns the admission queue wait budget as a [`Duration`].
    #[must_use]
    pub fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.limits.admission_wait_ms)
    }

    /// Returns the breaker cooldown as a [`Duration`].
    #[must_use]
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker.cooldown_ms)
    }

    /// Returns the fallback-tier TTL as a [`Duration`].
    #[must_use]
    pub fn fallback_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.fallback_ttl_ms)
    }

    /// Returns the batching window as a [`Duration`].
    #[must_use]
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.coordinator.batch_window_ms)
    }

    /// Returns the in-flight staleness threshold as a [`Duration`].
    #[must_use]
    pub fn inflight_stale_after(&self) -> Duration {
        Duration::from_millis(self.coordinator.inflight_stale_after_ms)
    }
}

/// Partial runtime configuration overlay for `update_config()`.
///
/// Only the present fields change; everything else keeps its current
/// value. Sizing fields (store capacity, concurrency limit) are absent by
/// design: they are bound to live structures at build time and require a
/// rebuild to change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub cache_strategy: Option<CacheStrategy>,
    pub base_ttl_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub breaker_threshold: Option<u32>,
    pub breaker_cooldown_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_initial_delay_ms: Option<u64>,
    pub batching_enabled: Option<bool>,
    pub priority_enabled: Option<bool>,
}

impl ConfigUpdate {
    /// Applies the overlay to a config, returning the merged result.
    #[must_use]
    pub fn apply(&self, current: &GatewayConfig) -> GatewayConfig {
        let mut next = current.clone();
        if let Some(strategy) = self.cache_strategy {
            next.cache.strategy = strategy;
        }
        if let Some(base_ttl_ms) = self.base_ttl_ms {
            next.cache.base_ttl_ms = base_ttl_ms;
        }
        if let Some(request_timeout_ms) = self.request_timeout_ms {
            next.limits.request_timeout_ms = request_timeout_ms;
        }
        if let Some(threshold) = self.breaker_threshold {
            next.breaker.threshold = threshold;
        }
        if let Some(cooldown_ms) = self.breaker_cooldown_ms {
            next.breaker.cooldown_ms = cooldown_ms;
        }
        if let Some(max_retries) = self.max_retries {
            next.retry.max_retries = max_retries;
        }
        if let Some(initial_delay_ms) = self.retry_initial_delay_ms {
            next.retry.initial_delay_ms = initial_delay_ms;
        }
        if let Some(batching_enabled) = self.batching_enabled {
            next.coordinator.batching_enabled = batching_enabled;
        }
        if let Some(priority_enabled) = self.priority_enabled {
            next.coordinator.priority_enabled = priority_enabled;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.max_concurrent_requests, 8);
        assert_eq!(config.breaker.threshold, 5);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.coordinator.batching_enabled);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let toml = r#"
            [limits]
            max_concurrent_requests = 4

            [cache]
            strategy = "aggressive"
            base_ttl_ms = 60000

            [breaker]
            threshold = 3
        "#;
        let config: GatewayConfig = toml::from_str(toml).unwrap();

        assert_eq!(config.limits.max_concurrent_requests, 4);
        assert_eq!(config.cache.strategy, CacheStrategy::Aggressive);
        assert_eq!(config.cache.base_ttl_ms, 60_000);
        assert_eq!(config.breaker.threshold, 3);
        // Untouched sections keep their defaults
        assert_eq!(config.limits.request_timeout_ms, 10_000);
        assert_eq!(config.breaker.cooldown_ms, 30_000);
    }

    #[test]
    fn test_validation_rejects_inverted_ttl_clamp() {
        let mut config = GatewayConfig::default();
        config.cache.min_ttl_ms = 10_000;
        config.cache.max_ttl_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        let mut config = GatewayConfig::default();
        config.limits.max_concurrent_requests = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.cache.max_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ttl_policy_keeps_builtin_multipliers_when_unset() {
        let config = GatewayConfig::default();
        let policy = config.ttl_policy();
        assert!(policy.entity_ttl_multipliers.contains_key("trending"));

        let mut config = GatewayConfig::default();
        config.cache.entity_ttl_multipliers.insert("music".to_string(), 3.0);
        let policy = config.ttl_policy();
        assert_eq!(policy.entity_ttl_multipliers.get("music"), Some(&3.0));
        assert!(!policy.entity_ttl_multipliers.contains_key("trending"));
    }

    #[test]
    fn test_config_update_overlays_only_present_fields() {
        let current = GatewayConfig::default();
        let update = ConfigUpdate {
            cache_strategy: Some(CacheStrategy::Conservative),
            breaker_threshold: Some(2),
            ..Default::default()
        };

        let next = update.apply(&current);
        assert_eq!(next.cache.strategy, CacheStrategy::Conservative);
        assert_eq!(next.breaker.threshold, 2);
        // Untouched fields carry over
        assert_eq!(next.retry.max_retries, current.retry.max_retries);
        assert_eq!(next.limits.request_timeout_ms, current.limits.request_timeout_ms);
    }
}
