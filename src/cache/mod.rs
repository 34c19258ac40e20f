//! Bounded in-memory TTL cache
//!
//! Expiry is checked lazily on read. When the cache is full, expired
//! entries are swept first and then the oldest ~10% (by insertion order)
//! are evicted in one batch, which bounds memory without maintaining a
//! full LRU ordering.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default maximum number of entries for a cache instance
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Snapshot of cache counters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub evictions: u64,
}

/// Result of [`Cache::insert_if_absent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Inserted,
    /// A live entry already holds the key
    Present,
    /// Every slot holds a live entry; nothing was evicted
    Full,
}

/// Key/value cache with per-entry expiry
///
/// Implementations must be safe to share across request handlers.
pub trait Cache<V>: Send + Sync {
    /// Look up a live entry. Expired entries count as a miss and are removed.
    fn get(&self, key: &str) -> Option<V>;

    /// Insert or overwrite an entry
    fn set(&self, key: &str, value: V, ttl: Duration);

    /// Insert only if no live entry exists.
    ///
    /// Unlike `set`, this never evicts live entries to make room: a caller
    /// using the cache as a "seen" set must not forget keys early.
    fn insert_if_absent(&self, key: &str, value: V, ttl: Duration) -> Admission;

    /// Remove an entry. Returns true if something was removed.
    fn delete(&self, key: &str) -> bool;

    fn clear(&self);

    fn stats(&self) -> CacheStats;
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    /// Monotonic insertion sequence, used for batch eviction
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    next_seq: u64,
}

/// Mutex-guarded TTL cache
///
/// The lock is only held for map operations; nothing awaits while holding it.
pub struct TtlCache<V> {
    inner: Mutex<CacheInner<V>>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone + Send> TtlCache<V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner<V>> {
        // A panic while holding the lock cannot leave the map half-updated,
        // so recovering from poisoning is sound.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make room for one new key. Caller holds the lock.
    fn make_room(&self, inner: &mut CacheInner<V>, now: Instant) {
        if inner.entries.len() < self.max_size {
            return;
        }

        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));

        if inner.entries.len() >= self.max_size {
            let batch = self.max_size.div_ceil(10);
            let mut by_age: Vec<(u64, String)> = inner
                .entries
                .iter()
                .map(|(key, entry)| (entry.seq, key.clone()))
                .collect();
            by_age.sort_unstable_by_key(|(seq, _)| *seq);

            for (_, key) in by_age.into_iter().take(batch) {
                inner.entries.remove(&key);
            }
        }

        let removed = before - inner.entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!(removed, max_size = self.max_size, "cache eviction pass");
    }

    fn insert_locked(&self, inner: &mut CacheInner<V>, key: &str, value: V, ttl: Duration, now: Instant) {
        if !inner.entries.contains_key(key) {
            self.make_room(inner, now);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
                seq,
            },
        );
    }
}

impl<V: Clone + Send> Cache<V> for TtlCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();

        let found = match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };
        drop(inner);

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn set(&self, key: &str, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.lock();
        self.insert_locked(&mut inner, key, value, ttl, now);
    }

    fn insert_if_absent(&self, key: &str, value: V, ttl: Duration) -> Admission {
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Admission::Present,
            Some(_) => {}
            None => {
                if inner.entries.len() >= self.max_size {
                    let before = inner.entries.len();
                    inner.entries.retain(|_, entry| !entry.is_expired(now));
                    let removed = before - inner.entries.len();
                    self.evictions.fetch_add(removed as u64, Ordering::Relaxed);

                    if inner.entries.len() >= self.max_size {
                        return Admission::Full;
                    }
                }
            }
        }

        self.insert_locked(&mut inner, key, value, ttl, now);
        Admission::Inserted
    }

    fn delete(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    fn clear(&self) {
        self.lock().entries.clear();
    }

    fn stats(&self) -> CacheStats {
        let size = self.lock().entries.len();
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total = hit_count + miss_count;

        CacheStats {
            size,
            max_size: self.max_size,
            hit_count,
            miss_count,
            hit_rate: if total == 0 {
                0.0
            } else {
                hit_count as f64 / total as f64
            },
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

type StatsFn = Box<dyn Fn() -> CacheStats + Send + Sync>;

/// Named cache instances, for reporting
#[derive(Default)]
pub struct CacheRegistry {
    entries: Vec<(String, StatsFn)>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<V: 'static>(&mut self, name: &str, cache: Arc<dyn Cache<V>>) {
        self.entries
            .push((name.to_string(), Box::new(move || cache.stats())));
    }

    pub fn snapshot(&self) -> BTreeMap<String, CacheStats> {
        self.entries
            .iter()
            .map(|(name, stats)| (name.clone(), stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_set_and_get() {
        let cache = TtlCache::new(10);
        cache.set("a", 1, MINUTE);

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_overwrite_replaces_value() {
        let cache = TtlCache::new(10);
        cache.set("a", 1, MINUTE);
        cache.set("a", 2, MINUTE);

        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn test_expired_entry_is_absent_and_removed() {
        let cache = TtlCache::new(10);
        cache.set("short", "v", Duration::from_millis(20));
        cache.set("long", "v", MINUTE);

        assert_eq!(cache.get("short"), Some("v"));
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some("v"));
        // Lazy deletion dropped the expired entry
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache = TtlCache::new(10);
        cache.set("a", 1, MINUTE);

        cache.get("a");
        cache.get("a");
        cache.get("a");
        cache.get("b");

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 3);
        assert_eq!(stats.miss_count, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.max_size, 10);
    }

    #[test]
    fn test_full_cache_evicts_oldest_batch() {
        let cache = TtlCache::new(20);
        for i in 0..20 {
            cache.set(&format!("k{i}"), i, MINUTE);
        }

        cache.set("new", 99, MINUTE);

        let stats = cache.stats();
        // 10% of 20 = 2 oldest entries evicted, then one inserted
        assert_eq!(stats.size, 19);
        assert_eq!(stats.evictions, 2);
        assert_eq!(cache.get("k0"), None);
        assert_eq!(cache.get("k1"), None);
        assert_eq!(cache.get("k2"), Some(2));
        assert_eq!(cache.get("new"), Some(99));
    }

    #[test]
    fn test_full_cache_prefers_sweeping_expired() {
        let cache = TtlCache::new(10);
        for i in 0..5 {
            cache.set(&format!("old{i}"), i, Duration::from_millis(10));
        }
        for i in 0..5 {
            cache.set(&format!("live{i}"), i, MINUTE);
        }
        std::thread::sleep(Duration::from_millis(30));

        cache.set("new", 42, MINUTE);

        assert_eq!(cache.stats().size, 6);
        for i in 0..5 {
            assert_eq!(cache.get(&format!("live{i}")), Some(i));
        }
    }

    #[test]
    fn test_overwrite_when_full_does_not_evict() {
        let cache = TtlCache::new(3);
        cache.set("a", 1, MINUTE);
        cache.set("b", 2, MINUTE);
        cache.set("c", 3, MINUTE);

        cache.set("a", 10, MINUTE);

        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("a"), Some(10));
    }

    #[test]
    fn test_insert_if_absent() {
        let cache = TtlCache::new(10);
        assert_eq!(cache.insert_if_absent("k", (), MINUTE), Admission::Inserted);
        assert_eq!(cache.insert_if_absent("k", (), MINUTE), Admission::Present);

        cache.set("e", (), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.insert_if_absent("e", (), MINUTE), Admission::Inserted);
    }

    #[test]
    fn test_insert_if_absent_never_evicts_live_entries() {
        let cache = TtlCache::new(3);
        for key in ["a", "b", "c"] {
            assert_eq!(cache.insert_if_absent(key, (), MINUTE), Admission::Inserted);
        }

        assert_eq!(cache.insert_if_absent("d", (), MINUTE), Admission::Full);
        assert_eq!(cache.insert_if_absent("a", (), MINUTE), Admission::Present);
        assert_eq!(cache.stats().size, 3);
        assert_eq!(cache.stats().evictions, 0);

        // Expired entries still make room
        cache.set("c", (), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.insert_if_absent("d", (), MINUTE), Admission::Inserted);
        assert_eq!(cache.insert_if_absent("a", (), MINUTE), Admission::Present);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = TtlCache::new(10);
        cache.set("a", 1, MINUTE);
        cache.set("b", 2, MINUTE);

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.get("a"), None);

        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_concurrent_insert_if_absent_single_winner() {
        let cache: Arc<TtlCache<()>> = Arc::new(TtlCache::new(100));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.insert_if_absent("token", (), MINUTE))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admission| *admission == Admission::Inserted)
            .count();

        assert_eq!(winners, 1);
    }

    #[test]
    fn test_registry_snapshot() {
        let words: Arc<TtlCache<String>> = Arc::new(TtlCache::new(10));
        let flags: Arc<TtlCache<()>> = Arc::new(TtlCache::new(20));
        words.set("a", "alpha".to_string(), MINUTE);
        words.get("a");

        let mut registry = CacheRegistry::new();
        registry.register::<String>("words", words);
        registry.register::<()>("flags", flags);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["words"].size, 1);
        assert_eq!(snapshot["words"].hit_count, 1);
        assert_eq!(snapshot["flags"].max_size, 20);
    }
}
