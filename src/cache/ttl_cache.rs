//! Expiring key-value cache with approximate LRU eviction

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache entry with TTL and access bookkeeping
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    data: V,
    timestamp: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed: Instant,
}

impl<V> CacheEntry<V> {
    fn new(data: V, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            data,
            timestamp: now,
            ttl,
            access_count: 0,
            last_accessed: now,
        }
    }

    fn hit(&mut self, now: Instant, refresh: bool) {
        self.access_count += 1;
        self.last_accessed = now;
        if refresh {
            self.timestamp = now;
        }
    }

    /// An entry is logically gone once its age exceeds the TTL, swept or not.
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) > self.ttl
    }
}

/// TTL cache bounded by `max_size`.
///
/// When full, inserting a new key evicts the entry that was read least
/// recently. Expired entries are dropped lazily on read and in bulk by
/// [`TtlCache::cleanup`].
pub struct TtlCache<V> {
    name: String,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
    max_size: usize,
}

impl<V: Clone> TtlCache<V> {
    /// Create a new cache with a default TTL and max size
    pub fn new(default_ttl: Duration, max_size: usize) -> Self {
        Self::named("cache", default_ttl, max_size)
    }

    /// Create a cache whose name shows up in logs and metrics
    pub fn named(name: impl Into<String>, default_ttl: Duration, max_size: usize) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            default_ttl,
            max_size: max_size.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a value with the default TTL
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, None);
    }

    /// Store a value with an explicit TTL (falls back to the default)
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let entry = CacheEntry::new(value, ttl.unwrap_or(self.default_ttl));

        let mut entries = self.lock();
        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            self.evict_least_recent(&mut entries);
        }
        entries.insert(key, entry);
    }

    /// Get a value if present and not expired
    pub fn get(&self, key: &str) -> Option<V> {
        self.lookup(key, false)
    }

    /// Like [`TtlCache::get`], but a hit restarts the entry's TTL so
    /// only idle entries expire.
    pub fn touch(&self, key: &str) -> Option<V> {
        self.lookup(key, true)
    }

    fn lookup(&self, key: &str, refresh: bool) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.lock();

        let expired = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hit(now, refresh);
                return Some(entry.data.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.remove(key);
        }
        None
    }

    /// Return the live value for `key`, inserting `init()` first when absent.
    ///
    /// The lookup and insert happen under one lock, so concurrent callers
    /// always observe the same value.
    pub fn get_or_insert_with<F>(&self, key: &str, init: F) -> V
    where
        F: FnOnce() -> V,
    {
        self.lookup_or_insert(key, false, init)
    }

    /// Sliding-expiry variant of [`TtlCache::get_or_insert_with`]: a hit
    /// restarts the entry's TTL.
    pub fn get_or_insert_touched<F>(&self, key: &str, init: F) -> V
    where
        F: FnOnce() -> V,
    {
        self.lookup_or_insert(key, true, init)
    }

    fn lookup_or_insert<F>(&self, key: &str, refresh: bool, init: F) -> V
    where
        F: FnOnce() -> V,
    {
        let now = Instant::now();
        let mut entries = self.lock();

        if let Some(entry) = entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.hit(now, refresh);
                return entry.data.clone();
            }
        }

        if entries.len() >= self.max_size && !entries.contains_key(key) {
            self.evict_least_recent(&mut entries);
        }
        let value = init();
        entries.insert(key.to_string(), CacheEntry::new(value.clone(), self.default_ttl));
        value
    }

    /// Check for a live entry without touching its access stats
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    /// Remove an entry, returning whether it existed
    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of physically stored entries (expired ones included until swept)
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Keys of all live entries
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Snapshot of all live values
    pub fn values(&self) -> Vec<V> {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.data.clone())
            .collect()
    }

    /// Remove all expired entries, returning how many were dropped
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();

        if removed > 0 {
            debug!(cache = %self.name, removed, remaining = entries.len(), "Swept expired entries");
        }
        removed
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.lock();

        let expired = entries.values().filter(|entry| entry.is_expired(now)).count();
        let total_accesses = entries.values().map(|entry| entry.access_count).sum();
        let total_age: Duration = entries
            .values()
            .map(|entry| now.saturating_duration_since(entry.timestamp))
            .sum();
        let average_age = if entries.is_empty() {
            Duration::ZERO
        } else {
            total_age / entries.len() as u32
        };

        CacheStats {
            size: entries.len(),
            max_size: self.max_size,
            expired,
            total_accesses,
            average_age,
        }
    }

    /// Evict the entry read least recently
    fn evict_least_recent(&self, entries: &mut HashMap<String, CacheEntry<V>>) {
        if let Some(oldest_key) = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone())
        {
            debug!(cache = %self.name, key = %oldest_key, "Evicting least recently used entry");
            entries.remove(&oldest_key);
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub expired: usize,
    pub total_accesses: u64,
    pub average_age: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_set_and_get() {
        let cache = TtlCache::new(Duration::from_secs(60), 100);
        cache.set("k", "v".to_string());

        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert!(cache.has("k"));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_cache_expiration() {
        let cache = TtlCache::new(Duration::from_millis(500), 100);
        cache.set("k", "v".to_string());

        // Should be available immediately
        assert_eq!(cache.get("k"), Some("v".to_string()));

        // Wait for expiration
        std::thread::sleep(Duration::from_millis(600));

        assert_eq!(cache.get("k"), None);
        assert!(!cache.has("k"));
    }

    #[test]
    fn test_explicit_ttl_overrides_default() {
        let cache = TtlCache::new(Duration::from_secs(60), 100);
        cache.set_with_ttl("short", 1, Some(Duration::from_millis(50)));
        cache.set("long", 2);

        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some(2));
    }

    #[test]
    fn test_bounded_size_evicts_least_recently_read() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.set("a", 1);
        std::thread::sleep(Duration::from_millis(5));
        cache.set("b", 2);
        std::thread::sleep(Duration::from_millis(5));

        // Reading "a" makes "b" the least recently accessed
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_overwrite_at_capacity_does_not_evict() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn test_never_exceeds_max_size() {
        let cache = TtlCache::new(Duration::from_secs(60), 10);
        for i in 0..11 {
            cache.set(format!("key-{}", i), i);
        }
        assert_eq!(cache.len(), 10);
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let cache = TtlCache::new(Duration::from_millis(50), 100);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set_with_ttl("c", 3, Some(Duration::from_secs(60)));

        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(cache.cleanup(), 2);
        assert_eq!(cache.cleanup(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = TtlCache::new(Duration::from_secs(60), 100);
        cache.set("a", 1);
        cache.set("b", 2);

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_or_insert_with_reuses_live_value() {
        let cache = TtlCache::new(Duration::from_secs(60), 100);
        let first = cache.get_or_insert_with("k", || 1);
        let second = cache.get_or_insert_with("k", || 2);

        assert_eq!(first, 1);
        assert_eq!(second, 1);
    }

    #[test]
    fn test_touch_keeps_active_entry_alive() {
        let cache = TtlCache::new(Duration::from_millis(150), 100);
        cache.set("active", 1);
        cache.set("idle", 2);

        // Six touches 50ms apart span twice the TTL
        for _ in 0..6 {
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(cache.touch("active"), Some(1));
        }

        assert_eq!(cache.get("idle"), None);
        assert_eq!(cache.get("active"), Some(1));
        assert_eq!(cache.touch("missing"), None);
    }

    #[test]
    fn test_plain_get_does_not_extend_ttl() {
        let cache = TtlCache::new(Duration::from_millis(150), 100);
        cache.set("k", 1);

        for _ in 0..2 {
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(cache.get("k"), Some(1));
        }
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_get_or_insert_touched_slides_expiry() {
        let cache = TtlCache::new(Duration::from_millis(150), 100);
        assert_eq!(cache.get_or_insert_touched("k", || 1), 1);

        for _ in 0..6 {
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(cache.get_or_insert_touched("k", || 2), 1);
        }

        // Once idle past the TTL a fresh value is created
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(cache.get_or_insert_touched("k", || 3), 3);
    }

    #[test]
    fn test_stats() {
        let cache = TtlCache::new(Duration::from_millis(50), 100);
        cache.set("a", 1);
        cache.set_with_ttl("b", 2, Some(Duration::from_secs(60)));
        cache.get("b");
        cache.get("b");

        std::thread::sleep(Duration::from_millis(80));

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.total_accesses, 2);
        assert!(stats.average_age >= Duration::from_millis(80));
    }
}
