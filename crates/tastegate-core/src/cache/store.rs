//! Primary tiered cache store: TTL + LRU + hit/miss accounting.
//!
//! Values are held as canonical JSON bytes and decoded on read, so a
//! malformed stored value surfaces as [`CacheError::Corrupt`] instead of
//! being silently returned. A hard byte ceiling bounds memory: writes that
//! would breach it fail with [`CacheError::MemoryCeilingExceeded`] and are
//! handled by the error-recovery pipeline rather than swallowed.
//!
//! Expiry is lazy: `get` treats an entry older than its TTL as absent and
//! removes it. Eviction is global LRU across all entity types; callers
//! needing isolation use distinct key namespaces.

use crate::cache::key::RequestKey;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by cache reads and writes.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Stored bytes failed to decode as JSON. The entry has been removed.
    #[error("corrupt cache entry for {key}: {detail}")]
    Corrupt { key: String, detail: String },

    /// Writing the entry would exceed the configured hard byte ceiling.
    #[error("cache memory ceiling exceeded: entry of {needed} bytes against ceiling {ceiling}")]
    MemoryCeilingExceeded { needed: usize, ceiling: usize },

    /// Value could not be serialized for storage.
    #[error("failed to serialize cache value: {0}")]
    Serialize(String),

    /// Invalid configuration parameter (typically zero capacity).
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Sizing configuration for the primary store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStoreConfig {
    /// Maximum number of entries before LRU eviction (default: 10,000).
    pub max_entries: usize,
    /// Hard ceiling on total stored bytes (default: 64 MiB).
    pub max_bytes: usize,
}

impl Default for CacheStoreConfig {
    fn default() -> Self {
        Self { max_entries: 10_000, max_bytes: 64 * 1024 * 1024 }
    }
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStoreStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

impl CacheStoreStats {
    /// Hit rate in `[0.0, 1.0]`; 0.0 when no lookups have happened.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct StoredEntry {
    bytes: Bytes,
    created_at: Instant,
    ttl: Duration,
    hit_count: u64,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

/// Tiered key/value store with TTL, LRU eviction, and hit/miss accounting.
///
/// A single mutex guards the LRU map so that concurrent `get`/`set` on the
/// same key are linearizable: two concurrent writers cannot corrupt an
/// entry and a reader never observes a partially-written one. Critical
/// sections are short in-memory operations; nothing blocks under the lock.
pub struct CacheStore {
    inner: Mutex<LruCache<RequestKey, StoredEntry>>,
    max_bytes: usize,
    total_bytes: AtomicUsize,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl CacheStore {
    /// Creates a new store.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidConfig` if `max_entries` or `max_bytes`
    /// is zero.
    pub fn new(config: &CacheStoreConfig) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(config.max_entries)
            .ok_or_else(|| CacheError::InvalidConfig("max_entries must be non-zero".into()))?;
        if config.max_bytes == 0 {
            return Err(CacheError::InvalidConfig("max_bytes must be non-zero".into()));
        }

        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity)),
            max_bytes: config.max_bytes,
            total_bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        })
    }

    /// Looks up a key, promoting it in LRU order on a hit.
    ///
    /// Expired entries are removed and reported as a miss.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Corrupt` if the stored bytes fail to decode.
    /// The corrupt entry is removed so subsequent lookups miss cleanly.
    pub fn get(&self, key: &RequestKey) -> Result<Option<serde_json::Value>, CacheError> {
        let now = Instant::now();
        let bytes = {
            let mut inner = self.inner.lock();
            match inner.get_mut(key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Some(entry) if entry.is_expired(now) => {
                    let removed = inner.pop(key);
                    if let Some(entry) = removed {
                        self.total_bytes.fetch_sub(entry.bytes.len(), Ordering::Relaxed);
                    }
                    self.expired.fetch_add(1, Ordering::Relaxed);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Some(entry) => {
                    entry.hit_count += 1;
                    entry.bytes.clone()
                }
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            Err(e) => {
                // Corrupt entries are evicted immediately so they can be refetched
                warn!(key = %key, error = %e, "removing corrupt cache entry");
                if let Some(entry) = self.inner.lock().pop(key) {
                    self.total_bytes.fetch_sub(entry.bytes.len(), Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Corrupt { key: key.to_string(), detail: e.to_string() })
            }
        }
    }

    /// Inserts a value with the given TTL, evicting least-recently-used
    /// entries as needed to stay within entry and byte limits.
    ///
    /// # Errors
    ///
    /// - `CacheError::MemoryCeilingExceeded` if the entry alone would
    ///   breach the byte ceiling.
    /// - `CacheError::Serialize` if the value cannot be serialized.
    pub fn set(
        &self,
        key: &RequestKey,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let encoded = serde_json::to_vec(value).map_err(|e| CacheError::Serialize(e.to_string()))?;
        if encoded.len() > self.max_bytes {
            return Err(CacheError::MemoryCeilingExceeded {
                needed: encoded.len(),
                ceiling: self.max_bytes,
            });
        }

        let entry = StoredEntry {
            bytes: Bytes::from(encoded),
            created_at: Instant::now(),
            ttl,
            hit_count: 0,
        };
        let entry_len = entry.bytes.len();

        let mut inner = self.inner.lock();
        if let Some(displaced) = inner.push(key.clone(), entry) {
            self.total_bytes.fetch_sub(displaced.1.bytes.len(), Ordering::Relaxed);
            // push displaces either the previous value for this key or, at
            // capacity, the least-recently-used entry
            if displaced.0 != *key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %displaced.0, "cache entry evicted (capacity)");
            }
        }
        self.total_bytes.fetch_add(entry_len, Ordering::Relaxed);

        // Byte ceiling: shed LRU entries until back under the ceiling
        while self.total_bytes.load(Ordering::Relaxed) > self.max_bytes {
            match inner.pop_lru() {
                Some((evicted_key, evicted)) => {
                    self.total_bytes.fetch_sub(evicted.bytes.len(), Ordering::Relaxed);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(evicted = %evicted_key, "cache entry evicted (byte ceiling)");
                }
                None => break,
            }
        }

        Ok(())
    }

    /// Removes a single entry. Returns `true` if it existed.
    pub fn invalidate(&self, key: &RequestKey) -> bool {
        let removed = self.inner.lock().pop(key);
        if let Some(entry) = removed {
            self.total_bytes.fetch_sub(entry.bytes.len(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Clears entries whose canonical key starts with `prefix`, or the
    /// whole store when `prefix` is `None`. Returns the number removed.
    pub fn clear(&self, prefix: Option<&str>) -> usize {
        let mut inner = self.inner.lock();
        match prefix {
            None => {
                let removed = inner.len();
                inner.clear();
                self.total_bytes.store(0, Ordering::Relaxed);
                info!(removed, "cache cleared");
                removed
            }
            Some(prefix) => {
                let matching: Vec<RequestKey> = inner
                    .iter()
                    .filter(|(key, _)| key.as_str().starts_with(prefix))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &matching {
                    if let Some(entry) = inner.pop(key) {
                        self.total_bytes.fetch_sub(entry.bytes.len(), Ordering::Relaxed);
                    }
                }
                info!(prefix, removed = matching.len(), "cache namespace cleared");
                matching.len()
            }
        }
    }

    /// Returns current statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStoreStats {
        CacheStoreStats {
            entries: self.inner.lock().len(),
            bytes: self.total_bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    /// Inserts raw bytes directly, bypassing serialization.
    ///
    /// Test-only hook for exercising the corruption path.
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &RequestKey, bytes: &[u8], ttl: Duration) {
        let entry = StoredEntry {
            bytes: Bytes::copy_from_slice(bytes),
            created_at: Instant::now(),
            ttl,
            hit_count: 0,
        };
        self.total_bytes.fetch_add(entry.bytes.len(), Ordering::Relaxed);
        if let Some(displaced) = self.inner.lock().push(key.clone(), entry) {
            self.total_bytes.fetch_sub(displaced.1.bytes.len(), Ordering::Relaxed);
        }
    }
}
