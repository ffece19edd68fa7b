//! # Compilation Cache
//!
//! Hash-validated, LRU-bounded cache of compile outputs, keyed by pipeline
//! name. An entry is valid only while its `(source_hash, registry_hash)`
//! pair matches the caller's: a drifted source or registry evicts the
//! stale entry in line with the miss. TTL is checked on every read.
//!
//! The payload holds live module references, so the backing store must be
//! in-process; the [`CacheStore`] trait nonetheless lets an implementer
//! plug a different in-memory store while the facade preserves the TTL and
//! LRU semantics.
//!
//! ## Concurrency
//!
//! Reads and writes interleave: stats are atomics, the LRU clock is a
//! monotonic counter, and the get-and-touch / put-and-evict paths hold a
//! short mutex so LRU updates stay atomic with the state transition.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One cached compilation
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub payload: T,
    pub source_hash: String,
    pub registry_hash: String,
    pub inserted_at: Instant,
    /// LRU clock value of the last access
    pub last_access: u64,
}

/// Pluggable in-process backing store
pub trait CacheStore<T>: Send + Sync {
    fn get(&self, name: &str) -> Option<CacheEntry<T>>;
    fn insert(&self, name: String, entry: CacheEntry<T>);
    fn remove(&self, name: &str) -> bool;
    fn clear(&self);
    fn len(&self) -> usize;
    /// Update an entry's LRU clock
    fn touch(&self, name: &str, access: u64);
    /// Key with the smallest LRU clock
    fn lru_candidate(&self) -> Option<String>;
}

/// The default hash-map store
pub struct InMemoryStore<T> {
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
}

impl<T> InMemoryStore<T> {
    pub fn new() -> Self {
        InMemoryStore {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        InMemoryStore::new()
    }
}

impl<T: Clone + Send + Sync> CacheStore<T> for InMemoryStore<T> {
    fn get(&self, name: &str) -> Option<CacheEntry<T>> {
        self.entries.read().get(name).cloned()
    }

    fn insert(&self, name: String, entry: CacheEntry<T>) {
        self.entries.write().insert(name, entry);
    }

    fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn touch(&self, name: &str, access: u64) {
        if let Some(entry) = self.entries.write().get_mut(name) {
            entry.last_access = access;
        }
    }

    fn lru_candidate(&self) -> Option<String> {
        self.entries
            .read()
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(name, _)| name.clone())
    }
}

/// Counters reported by [`CompilationCache::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

/// Cache facade: validation, TTL, LRU, stats
pub struct CompilationCache<T> {
    store: Box<dyn CacheStore<T>>,
    max_entries: usize,
    max_age: Duration,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_lock: Mutex<()>,
}

impl<T: Clone + Send + Sync + 'static> CompilationCache<T> {
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        Self::with_store(Box::new(InMemoryStore::new()), max_entries, max_age)
    }

    /// Build over a custom store; TTL and LRU semantics stay at the facade
    pub fn with_store(
        store: Box<dyn CacheStore<T>>,
        max_entries: usize,
        max_age: Duration,
    ) -> Self {
        CompilationCache {
            store,
            max_entries: max_entries.max(1),
            max_age,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Hit iff the stored entry matches both hashes and is within TTL.
    /// A hash mismatch or expired entry is evicted with the miss.
    pub fn get(&self, name: &str, source_hash: &str, registry_hash: &str) -> Option<T> {
        let _guard = self.write_lock.lock();
        let Some(entry) = self.store.get(name) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let stale = entry.source_hash != source_hash || entry.registry_hash != registry_hash;
        let expired = entry.inserted_at.elapsed() > self.max_age;
        if stale || expired {
            self.store.remove(name);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(pipeline = name, stale, expired, "compile_cache_evicted");
            return None;
        }

        let access = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.store.touch(name, access);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.payload)
    }

    /// Insert, evicting a same-name entry with a different key first and
    /// the least-recently-used entry when at capacity
    pub fn put(&self, name: &str, source_hash: &str, registry_hash: &str, payload: T) {
        let _guard = self.write_lock.lock();

        if let Some(existing) = self.store.get(name) {
            if existing.source_hash != source_hash || existing.registry_hash != registry_hash {
                self.store.remove(name);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        } else if self.store.len() >= self.max_entries {
            if let Some(victim) = self.store.lru_candidate() {
                self.store.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(pipeline = %victim, "compile_cache_lru_evicted");
            }
        }

        let access = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.store.insert(
            name.to_string(),
            CacheEntry {
                payload,
                source_hash: source_hash.to_string(),
                registry_hash: registry_hash.to_string(),
                inserted_at: Instant::now(),
                last_access: access,
            },
        );
    }

    pub fn invalidate(&self, name: &str) {
        let _guard = self.write_lock.lock();
        if self.store.remove(name) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn invalidate_all(&self) {
        let _guard = self.write_lock.lock();
        let size = self.store.len() as u64;
        self.store.clear();
        self.evictions.fetch_add(size, Ordering::Relaxed);
    }

    pub fn size(&self) -> usize {
        self.store.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.store.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> CompilationCache<String> {
        CompilationCache::new(2, Duration::from_secs(60))
    }

    #[test]
    fn test_put_then_get_round_trip() {
        let cache = cache();
        cache.put("p", "s1", "r1", "payload".to_string());
        assert_eq!(cache.get("p", "s1", "r1"), Some("payload".to_string()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_hash_mismatch_evicts_and_misses() {
        let cache = cache();
        cache.put("p", "s1", "r1", "v".to_string());

        assert_eq!(cache.get("p", "s2", "r1"), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 0);

        // Registry drift behaves the same
        cache.put("p", "s1", "r1", "v".to_string());
        assert_eq!(cache.get("p", "s1", "r2"), None);
    }

    #[test]
    fn test_ttl_expiry_is_a_miss() {
        let cache: CompilationCache<String> =
            CompilationCache::new(4, Duration::from_millis(0));
        cache.put("p", "s", "r", "v".to_string());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("p", "s", "r"), None);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = cache(); // capacity 2
        cache.put("a", "s", "r", "va".to_string());
        cache.put("b", "s", "r", "vb".to_string());

        // Touch "a" so "b" becomes the LRU victim
        assert!(cache.get("a", "s", "r").is_some());
        cache.put("c", "s", "r", "vc".to_string());

        assert_eq!(cache.size(), 2);
        assert!(cache.get("a", "s", "r").is_some());
        assert!(cache.get("c", "s", "r").is_some());
        assert!(cache.get("b", "s", "r").is_none());
    }

    #[test]
    fn test_same_name_different_key_replaces() {
        let cache = cache();
        cache.put("p", "s1", "r", "old".to_string());
        cache.put("p", "s2", "r", "new".to_string());

        assert_eq!(cache.get("p", "s2", "r"), Some("new".to_string()));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_invalidate() {
        let cache = cache();
        cache.put("p", "s", "r", "v".to_string());
        cache.invalidate("p");
        assert_eq!(cache.get("p", "s", "r"), None);
        // Invalidating an absent name is a no-op
        cache.invalidate("ghost");
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate_all() {
        let cache = cache();
        cache.put("a", "s", "r", "v".to_string());
        cache.put("b", "s", "r", "v".to_string());
        cache.invalidate_all();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_miss_on_absent_name() {
        let cache = cache();
        assert_eq!(cache.get("ghost", "s", "r"), None);
        assert_eq!(cache.stats().misses, 1);
    }
}
