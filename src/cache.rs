//! # Caches
//!
//! Two layers back shard resolution:
//!
//! - [`RegistryCache`]: in-process map of resolved shards plus the resolved default.
//!   Advisory only; any entry may be dropped at any time and is re-derived on the next miss.
//! - [`KvCache`]: optional shared fetch-or-compute store (memcache, redis, ...) consulted
//!   before the shard store on a miss. [`LruKvCache`] is the in-memory implementation.

use crate::error::ShardResult;
use crate::model::{Shard, ShardId};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fetch-or-compute key/value cache.
pub trait KvCache<V>: Send + Sync {
    /// Returns the cached value for `key`, computing and storing it on a miss.
    /// Errors from `compute` are returned and nothing is stored.
    fn fetch(&self, key: &str, compute: &mut dyn FnMut() -> ShardResult<V>) -> ShardResult<V>;

    fn delete(&self, key: &str);
}

/// Bounded in-memory [`KvCache`].
pub struct LruKvCache<V> {
    entries: Mutex<LruCache<String, V>>,
}

impl<V: Clone> LruKvCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + Send> KvCache<V> for LruKvCache<V> {
    fn fetch(&self, key: &str, compute: &mut dyn FnMut() -> ShardResult<V>) -> ShardResult<V> {
        if let Some(value) = self.entries.lock().get(key) {
            return Ok(value.clone());
        }
        // Computed outside the lock; concurrent misses may each compute once.
        let value = compute()?;
        self.entries.lock().put(key.to_string(), value.clone());
        Ok(value)
    }

    fn delete(&self, key: &str) {
        self.entries.lock().pop(key);
    }
}

/// Hit/miss counters for the registry cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// In-process cache of resolved shards, keyed by id.
///
/// `None` values record negative lookups.
pub struct RegistryCache {
    shards: RwLock<LruCache<ShardId, Option<Shard>>>,
    default: RwLock<Option<Shard>>,
    stats: CacheStats,
}

impl RegistryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            shards: RwLock::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN),
            )),
            default: RwLock::new(None),
            stats: CacheStats::default(),
        }
    }

    /// Outer `None` is a miss; `Some(None)` is a cached negative lookup.
    pub fn get(&self, id: ShardId) -> Option<Option<Shard>> {
        let mut shards = self.shards.write();
        match shards.get(&id) {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, id: ShardId, shard: Option<Shard>) {
        self.shards.write().put(id, shard);
    }

    pub fn remove(&self, id: ShardId) {
        self.shards.write().pop(&id);
    }

    pub fn default_shard(&self) -> Option<Shard> {
        self.default.read().clone()
    }

    pub fn set_default(&self, shard: Option<Shard>) {
        *self.default.write() = shard;
    }

    /// Drops every entry, including the default.
    pub fn clear(&self) {
        self.shards.write().clear();
        *self.default.write() = None;
    }

    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Independent copy with the same entries and fresh statistics.
    pub fn snapshot(&self) -> Self {
        let shards = self.shards.read();
        let mut copy = LruCache::new(shards.cap());
        // Oldest first so recency order survives the copy.
        for (id, shard) in shards.iter().rev() {
            copy.put(*id, shard.clone());
        }
        Self {
            shards: RwLock::new(copy),
            default: RwLock::new(self.default_shard()),
            stats: CacheStats::default(),
        }
    }
}
