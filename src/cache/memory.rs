//! Memory Tier - bounded LRU store
//!
//! Sub-millisecond lookups with strict entry-count bounds. The same type backs
//! the entry store and each of the three secondary indexes.
//!
//! # Design
//!
//! - `lru::LruCache` behind a `parking_lot::Mutex`; no operation suspends
//! - Recency is refreshed on read, so eviction removes the least recently
//!   *accessed* key rather than the oldest write
//! - Each slot carries the `cachedAt` of the entry it belongs to; expired slots
//!   read as absent but stay in place until evicted or cleared

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use super::entry::is_expired;

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    cached_at: DateTime<Utc>,
}

/// Bounded, TTL-aware LRU store
pub struct MemoryTier<V> {
    /// Label used in logs ("entries", "url-index", ...)
    name: &'static str,
    slots: Mutex<LruCache<String, Slot<V>>>,
    ttl: Duration,
    evictions: AtomicU64,
}

impl<V: Clone> MemoryTier<V> {
    /// Create a tier holding at most `capacity` keys (minimum 1)
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            slots: Mutex::new(LruCache::new(capacity)),
            ttl,
            evictions: AtomicU64::new(0),
        }
    }

    /// Insert or replace a value, evicting the least recently used key when full
    ///
    /// Returns the evicted key and value, if any.
    pub fn put(&self, key: String, value: V, cached_at: DateTime<Utc>) -> Option<(String, V)> {
        let mut slots = self.slots.lock();
        let displaced = slots.push(key.clone(), Slot { value, cached_at });

        match displaced {
            // Same key: a replacement, not an eviction
            Some((old_key, _)) if old_key == key => None,
            Some((old_key, slot)) => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(tier = self.name, key = %old_key, "evicted least recently used");
                Some((old_key, slot.value))
            }
            None => None,
        }
    }

    /// Get a value, refreshing its recency
    ///
    /// Expired values read as absent and do not gain recency.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut slots = self.slots.lock();
        match slots.peek(key) {
            Some(slot) if is_expired(slot.cached_at, self.ttl) => return None,
            Some(_) => {}
            None => return None,
        }
        slots.get(key).map(|slot| slot.value.clone())
    }

    /// Read a value without touching recency or checking expiry
    pub fn peek(&self, key: &str) -> Option<V> {
        self.slots.lock().peek(key).map(|slot| slot.value.clone())
    }

    /// Snapshot of all non-expired values, most recently used first
    pub fn values(&self) -> Vec<(String, V)> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| !is_expired(slot.cached_at, self.ttl))
            .map(|(key, slot)| (key.clone(), slot.value.clone()))
            .collect()
    }

    /// First non-expired key whose value matches, most recently used first
    ///
    /// Scans in place without cloning values or touching recency.
    pub fn find_key<F>(&self, mut matches: F) -> Option<String>
    where
        F: FnMut(&str, &V) -> bool,
    {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| !is_expired(slot.cached_at, self.ttl))
            .find(|(key, slot)| matches(key.as_str(), &slot.value))
            .map(|(key, _)| key.clone())
    }

    /// Remove a key
    pub fn remove(&self, key: &str) -> Option<V> {
        self.slots.lock().pop(key).map(|slot| slot.value)
    }

    /// Remove every key for which `keep` returns false; returns the count
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&str, &V) -> bool,
    {
        let mut slots = self.slots.lock();
        let doomed: Vec<String> = slots
            .iter()
            .filter(|(key, slot)| !keep(key.as_str(), &slot.value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            slots.pop(key);
        }
        doomed.len()
    }

    /// Clear the tier
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.lock().contains(key)
    }

    /// Number of keys physically held, expired ones included
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().cap().get()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn tier(capacity: usize) -> MemoryTier<u32> {
        MemoryTier::new("test", capacity, HOUR)
    }

    #[test]
    fn test_put_get() {
        let tier = tier(4);
        assert!(tier.put("a".into(), 1, Utc::now()).is_none());
        assert_eq!(tier.get("a"), Some(1));
        assert_eq!(tier.get("missing"), None);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.capacity(), 4);
    }

    #[test]
    fn test_replace_is_not_eviction() {
        let tier = tier(1);
        tier.put("a".into(), 1, Utc::now());
        assert!(tier.put("a".into(), 2, Utc::now()).is_none());
        assert_eq!(tier.get("a"), Some(2));
        assert_eq!(tier.evictions(), 0);
    }

    #[test]
    fn test_evicts_least_recently_accessed() {
        let tier = tier(2);
        tier.put("a".into(), 1, Utc::now());
        tier.put("b".into(), 2, Utc::now());

        // Reading "a" makes "b" the eviction candidate
        tier.get("a");
        let evicted = tier.put("c".into(), 3, Utc::now());

        assert_eq!(evicted, Some(("b".to_string(), 2)));
        assert!(tier.contains("a"));
        assert!(tier.contains("c"));
        assert_eq!(tier.evictions(), 1);
    }

    #[test]
    fn test_expired_reads_absent_but_stays() {
        let tier = MemoryTier::new("test", 4, Duration::from_secs(60));
        let old = Utc::now() - chrono::Duration::seconds(61);
        tier.put("a".into(), 1u32, old);

        assert_eq!(tier.get("a"), None);
        assert!(tier.contains("a"));
        assert_eq!(tier.peek("a"), Some(1));
        assert!(tier.values().is_empty());
    }

    #[test]
    fn test_find_key_scans_without_promoting() {
        let tier = MemoryTier::new("test", 3, Duration::from_secs(60));
        tier.put("stale".into(), 7u32, Utc::now() - chrono::Duration::seconds(61));
        tier.put("a".into(), 7, Utc::now());
        tier.put("b".into(), 7, Utc::now());

        // Most recently used match wins, expired slots are skipped
        assert_eq!(tier.find_key(|_, v| *v == 7), Some("b".to_string()));
        assert_eq!(tier.find_key(|k, _| k.starts_with('s')), None);
        assert_eq!(tier.find_key(|_, v| *v == 8), None);

        // Matching "a" does not make it recent
        assert_eq!(tier.find_key(|k, _| k == "a"), Some("a".to_string()));
        tier.remove("stale");
        tier.put("c".into(), 1, Utc::now());
        assert_eq!(tier.put("d".into(), 1, Utc::now()), Some(("a".to_string(), 7)));
    }

    #[test]
    fn test_expired_read_does_not_refresh_recency() {
        let tier = MemoryTier::new("test", 2, Duration::from_secs(60));
        let old = Utc::now() - chrono::Duration::seconds(61);
        tier.put("stale".into(), 1u32, old);
        tier.put("fresh".into(), 2, Utc::now());

        tier.get("stale");
        let evicted = tier.put("new".into(), 3, Utc::now());
        assert_eq!(evicted.map(|(k, _)| k), Some("stale".to_string()));
    }

    #[test]
    fn test_values_most_recent_first() {
        let tier = tier(3);
        tier.put("a".into(), 1, Utc::now());
        tier.put("b".into(), 2, Utc::now());
        tier.get("a");

        let keys: Vec<String> = tier.values().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_retain_and_clear() {
        let tier = tier(8);
        for i in 0..6u32 {
            tier.put(format!("k{}", i), i, Utc::now());
        }
        let removed = tier.retain(|_, v| v % 2 == 0);
        assert_eq!(removed, 3);
        assert_eq!(tier.len(), 3);

        assert_eq!(tier.remove("k0"), Some(0));
        tier.clear();
        assert!(tier.is_empty());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let tier = tier(0);
        assert_eq!(tier.capacity(), 1);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 1usize..16, keys in proptest::collection::vec(0u8..64, 0..200)) {
            let tier = tier(capacity);
            for k in keys {
                tier.put(k.to_string(), k as u32, Utc::now());
                prop_assert!(tier.len() <= capacity);
            }
        }

        #[test]
        fn prop_overflow_evicts_exactly_one(capacity in 1usize..16) {
            let tier = tier(capacity);
            for i in 0..capacity {
                tier.put(format!("k{}", i), i as u32, Utc::now());
            }
            let evicted = tier.put("overflow".into(), 0, Utc::now());
            prop_assert_eq!(evicted.map(|(k, _)| k), Some("k0".to_string()));
            prop_assert_eq!(tier.len(), capacity);
            prop_assert_eq!(tier.evictions(), 1);
        }
    }
}
