//! Per-module result cache
//!
//! A positive `cache_ms` on a call site caches results keyed by
//! `(module name, canonicalized input record)`. The backend is pluggable
//! via the `cache_backend` selector; the shared in-memory backend is the
//! default. TTL is checked on every read and expired entries are evicted
//! in line with the miss.

use crate::value::Value;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cache backend: string keys, typed values, per-entry TTL
pub trait ValueCacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn put(&self, key: String, value: Value, ttl: Duration);
    fn clear(&self);
}

/// The default shared in-memory backend
#[derive(Default)]
pub struct InMemoryValueCache {
    entries: DashMap<String, (Value, Instant)>,
}

impl InMemoryValueCache {
    pub fn new() -> Self {
        InMemoryValueCache::default()
    }
}

impl ValueCacheBackend for InMemoryValueCache {
    fn get(&self, key: &str) -> Option<Value> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                let (value, expires_at) = entry.value();
                if Instant::now() < *expires_at {
                    return Some(value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn put(&self, key: String, value: Value, ttl: Duration) {
        self.entries.insert(key, (value, Instant::now() + ttl));
    }

    fn clear(&self) {
        self.entries.clear();
    }
}

/// Backend registry: the default plus named alternates
pub struct CacheBackends {
    default: Arc<dyn ValueCacheBackend>,
    named: DashMap<String, Arc<dyn ValueCacheBackend>>,
}

impl CacheBackends {
    pub fn new() -> Self {
        CacheBackends {
            default: Arc::new(InMemoryValueCache::new()),
            named: DashMap::new(),
        }
    }

    /// Install a named backend for `cache_backend` selectors
    pub fn register(&self, name: impl Into<String>, backend: Arc<dyn ValueCacheBackend>) {
        self.named.insert(name.into(), backend);
    }

    /// Resolve a selector; unknown names fall back to the default
    pub fn resolve(&self, selector: Option<&str>) -> Arc<dyn ValueCacheBackend> {
        match selector {
            None => Arc::clone(&self.default),
            Some(name) => match self.named.get(name) {
                Some(backend) => Arc::clone(backend.value()),
                None => {
                    tracing::warn!(backend = name, "unknown_cache_backend_using_default");
                    Arc::clone(&self.default)
                }
            },
        }
    }

    pub fn clear_all(&self) {
        self.default.clear();
        for backend in &self.named {
            backend.value().clear();
        }
    }
}

impl Default for CacheBackends {
    fn default() -> Self {
        CacheBackends::new()
    }
}

/// Cache key for one module firing
pub fn cache_key(module: &str, input: &Value) -> String {
    format!("{module}|{}", input.canonical_key())
}
