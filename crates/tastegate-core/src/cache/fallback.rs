//! Secondary degraded-mode store.
//!
//! Written opportunistically on every successful fetch and whenever a
//! primary-store write fails, read only when the primary path cannot
//! produce data. TTLs here are deliberately looser than the primary
//! store's: stale recommendations beat no recommendations when the
//! upstream is down.
//!
//! Best-effort by design: no LRU ordering, no corruption surface (values
//! are kept as decoded JSON), and expiry is lazy with an occasional full
//! sweep when the store grows past its soft capacity.

use crate::cache::key::RequestKey;
use ahash::RandomState;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A degraded-mode entry.
#[derive(Clone)]
struct FallbackEntry {
    value: serde_json::Value,
    stored_at: Instant,
    ttl: Duration,
}

impl FallbackEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) > self.ttl
    }
}

/// Longer-lived secondary store for degraded responses.
pub struct FallbackStore {
    entries: DashMap<RequestKey, FallbackEntry, RandomState>,
    default_ttl: Duration,
    /// Soft capacity: exceeding it triggers an expired-entry sweep on the
    /// next write, and oldest-first shedding if the sweep is not enough.
    soft_capacity: usize,
}

impl FallbackStore {
    #[must_use]
    pub fn new(default_ttl: Duration, soft_capacity: usize) -> Self {
        Self {
            entries: DashMap::with_hasher(RandomState::new()),
            default_ttl,
            soft_capacity: soft_capacity.max(1),
        }
    }

    /// Stores a degraded copy of `value` under the store's default TTL.
    pub fn put(&self, key: &RequestKey, value: serde_json::Value) {
        trace!(key = %key, "storing fallback entry");
        self.entries.insert(
            key.clone(),
            FallbackEntry { value, stored_at: Instant::now(), ttl: self.default_ttl },
        );

        if self.entries.len() > self.soft_capacity {
            self.sweep();
        }
    }

    /// Returns a live entry, removing it if expired.
    #[must_use]
    pub fn get(&self, key: &RequestKey) -> Option<serde_json::Value> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => return Some(entry.value.clone()),
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Removes a single entry.
    pub fn invalidate(&self, key: &RequestKey) {
        self.entries.remove(key);
    }

    /// Number of entries currently held (including not-yet-swept expired ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops expired entries; if still over the soft capacity, sheds the
    /// oldest entries until back under it.
    fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));

        let over = self.entries.len().saturating_sub(self.soft_capacity);
        if over == 0 {
            return;
        }

        let mut by_age: Vec<(RequestKey, Instant)> =
            self.entries.iter().map(|e| (e.key().clone(), e.value().stored_at)).collect();
        by_age.sort_by_key(|(_, stored_at)| *stored_at);

        for (key, _) in by_age.into_iter().take(over) {
            self.entries.remove(&key);
        }
        debug!(shed = over, "fallback store shed oldest entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Params;
    use serde_json::json;

    fn key(name: &str) -> RequestKey {
        let params: Params = [(String::from("name"), name.into())].into_iter().collect();
        RequestKey::normalize("music", &params)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = FallbackStore::new(Duration::from_secs(60), 100);
        store.put(&key("a"), json!(["A", "B"]));

        assert_eq!(store.get(&key("a")), Some(json!(["A", "B"])));
        assert_eq!(store.get(&key("b")), None);
    }

    #[test]
    fn test_expired_entries_are_absent() {
        let store = FallbackStore::new(Duration::from_millis(30), 100);
        store.put(&key("a"), json!(1));

        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(store.get(&key("a")), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_soft_capacity_sheds_oldest() {
        let store = FallbackStore::new(Duration::from_secs(60), 3);
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            store.put(&key(name), json!(i));
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(store.len() <= 3);
        assert_eq!(store.get(&key("a")), None, "oldest entry should be shed");
        assert!(store.get(&key("d")).is_some());
    }
}
