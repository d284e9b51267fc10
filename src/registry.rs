//! # Shard Registry
//!
//! Resolves shard ids to [`Shard`]s through an advisory cache, and owns the notion of the
//! default shard.
//!
//! Lookups consult the in-process [`RegistryCache`] first, then the optional shared
//! [`KvCache`], then the [`ShardStore`]. Concurrent misses on the same id may each query the
//! store once; no lock is held across the query.
//!
//! The default shard always exists: until a real row flagged default is found, a
//! non-persisted placeholder stands in for it.

use crate::cache::{KvCache, RegistryCache};
use crate::config::{
    shard_cache_key, RegistryConfig, DEFAULT_RESOLUTION_DEPTH_LIMIT, DEFAULT_SHARD_CACHE_KEY,
};
use crate::error::{ShardError, ShardResult};
use crate::ids::ShardResolver;
use crate::model::{Shard, ShardId, ShardParams};
use crate::store::ShardStore;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Shared cache of optional shard rows (negative lookups are cached as `None`).
pub type SharedShardCache = Arc<dyn KvCache<Option<Shard>>>;

static NEXT_REGISTRY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Provisional answers for default-shard resolutions in progress on this thread,
    // keyed by registry.
    static RESOLVING_DEFAULT: RefCell<HashMap<u64, Vec<Shard>>> = RefCell::new(HashMap::new());
}

/// Marks a default-shard resolution by one registry in progress on the current thread.
struct ResolutionGuard {
    registry: u64,
}

impl ResolutionGuard {
    /// Returns the provisional answer instead of a guard when the depth limit is reached.
    fn enter(registry: u64, provisional: Shard) -> Result<Self, Shard> {
        RESOLVING_DEFAULT.with(|resolving| {
            let mut resolving = resolving.borrow_mut();
            let stack = resolving.entry(registry).or_default();
            if stack.len() >= DEFAULT_RESOLUTION_DEPTH_LIMIT {
                return Err(stack.last().cloned().unwrap_or(provisional));
            }
            stack.push(provisional);
            Ok(ResolutionGuard { registry })
        })
    }
}

impl Drop for ResolutionGuard {
    fn drop(&mut self) {
        RESOLVING_DEFAULT.with(|resolving| {
            let mut resolving = resolving.borrow_mut();
            if let Some(stack) = resolving.get_mut(&self.registry) {
                stack.pop();
                if stack.is_empty() {
                    resolving.remove(&self.registry);
                }
            }
        });
    }
}

/// Process-scoped shard registry.
pub struct ShardRegistry {
    resolver: u64,
    store: Arc<dyn ShardStore>,
    cache: RegistryCache,
    shared: Option<SharedShardCache>,
    config: RegistryConfig,
}

impl ShardRegistry {
    pub fn new(store: Arc<dyn ShardStore>, config: RegistryConfig) -> Self {
        Self {
            resolver: NEXT_REGISTRY.fetch_add(1, Ordering::Relaxed),
            cache: RegistryCache::new(config.cache_capacity),
            store,
            shared: None,
            config,
        }
    }

    /// Adds a shared fetch-or-compute cache consulted before the store.
    pub fn with_shared_cache(mut self, shared: SharedShardCache) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn store(&self) -> &Arc<dyn ShardStore> {
        &self.store
    }

    pub fn cache(&self) -> &RegistryCache {
        &self.cache
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Independent registry over the same store with a snapshot of this cache.
    ///
    /// Used for workers: they start warm but never mutate the parent's cache.
    pub fn fork(&self) -> Self {
        Self {
            resolver: NEXT_REGISTRY.fetch_add(1, Ordering::Relaxed),
            store: Arc::clone(&self.store),
            cache: self.cache.snapshot(),
            shared: self.shared.clone(),
            config: self.config.clone(),
        }
    }

    /// Resolves a shard by id; `Ok(None)` when no such shard exists.
    #[instrument(level = "trace", skip(self))]
    pub fn lookup(&self, id: ShardId) -> ShardResult<Option<Shard>> {
        if let Some(default) = self.cache.default_shard() {
            if default.id() == Some(id) {
                return Ok(Some(default));
            }
        }
        if let Some(entry) = self.cache.get(id) {
            return Ok(entry);
        }
        debug!(shard_id = %id, "registry cache miss");
        let found = self.fetch_shard(id)?;
        self.cache.put(id, found.clone());
        Ok(found)
    }

    /// Like [`lookup`](Self::lookup) but fails with [`ShardError::UnknownShard`] on a miss.
    pub fn require(&self, id: ShardId) -> ShardResult<Shard> {
        self.lookup(id)?.ok_or(ShardError::UnknownShard(id))
    }

    fn fetch_shard(&self, id: ShardId) -> ShardResult<Option<Shard>> {
        match &self.shared {
            Some(shared) => shared.fetch(&shard_cache_key(id), &mut || self.store.find_shard(id)),
            None => self.store.find_shard(id),
        }
    }

    fn fetch_default(&self) -> ShardResult<Option<Shard>> {
        match &self.shared {
            Some(shared) => shared.fetch(DEFAULT_SHARD_CACHE_KEY, &mut || self.store.find_default()),
            None => self.store.find_default(),
        }
    }

    /// Returns the shard flagged default.
    ///
    /// The first call (or any call with `reload`) queries the store. With no default row
    /// the placeholder is cached and returned. When the store is unreachable the
    /// placeholder, or with `with_fallback` the previously resolved default, is returned
    /// without being cached.
    ///
    /// Resolution is re-entrant: if the store query itself asks this registry for the
    /// default shard on the same thread, it receives the provisional answer instead of
    /// recursing. Other registries resolve normally.
    pub fn default_shard(&self, reload: bool, with_fallback: bool) -> Shard {
        let previous = self.cache.default_shard();
        if !reload {
            if let Some(shard) = &previous {
                return shard.clone();
            }
        }

        let fallback = match (&previous, with_fallback) {
            (Some(shard), true) => shard.clone(),
            _ => Shard::placeholder(),
        };
        let _guard = match ResolutionGuard::enter(self.resolver, fallback.clone()) {
            Ok(guard) => guard,
            Err(provisional) => {
                debug!("re-entrant default shard resolution, returning provisional shard");
                return provisional;
            }
        };

        match self.fetch_default() {
            Ok(Some(shard)) => {
                if let Some(id) = shard.id() {
                    self.cache.put(id, Some(shard.clone()));
                }
                self.cache.set_default(Some(shard.clone()));
                shard
            }
            Ok(None) => {
                debug!("no default shard row, using placeholder");
                let placeholder = Shard::placeholder();
                self.cache.set_default(Some(placeholder.clone()));
                placeholder
            }
            Err(err) => {
                warn!(error = %err, "default shard lookup failed, using fallback");
                fallback
            }
        }
    }

    /// Convenience for `default_shard(false, false)`.
    pub fn default(&self) -> Shard {
        self.default_shard(false, false)
    }

    /// Every shard row, cached as a side effect.
    pub fn all_shards(&self) -> ShardResult<Vec<Shard>> {
        let shards = self.store.all_shards()?;
        for shard in &shards {
            if let Some(id) = shard.id() {
                self.cache.put(id, Some(shard.clone()));
            }
        }
        Ok(shards)
    }

    /// Loads every shard and the default into the cache.
    pub fn preload_cache(&self) -> ShardResult<()> {
        let shards = self.all_shards()?;
        let default = shards
            .iter()
            .find(|shard| shard.default)
            .cloned()
            .unwrap_or_else(Shard::placeholder);
        debug!(count = shards.len(), "preloaded shard registry");
        self.cache.set_default(Some(default));
        Ok(())
    }

    /// Drops every in-process entry. Never needed for correctness.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Forgets everything cached about `id` and about the default shard.
    pub fn invalidate(&self, id: ShardId) {
        self.cache.remove(id);
        self.cache.set_default(None);
        if let Some(shared) = &self.shared {
            shared.delete(&shard_cache_key(id));
            shared.delete(DEFAULT_SHARD_CACHE_KEY);
        }
    }

    /// Creates a shard. A second default is rejected by the store with
    /// [`ShardError::DuplicateDefault`].
    pub fn create_shard(&self, params: ShardParams) -> ShardResult<Shard> {
        let shard = self.store.create_shard(params)?;
        if let Some(id) = shard.id() {
            self.invalidate(id);
        }
        Ok(shard)
    }

    /// Saves changes to an existing shard, under the same single-default rule.
    pub fn update_shard(&self, shard: &Shard) -> ShardResult<()> {
        let id = shard.id().ok_or(ShardError::InvalidShardId(0))?;
        self.store.update_shard(shard)?;
        self.invalidate(id);
        Ok(())
    }

    /// Destroys a shard. The store refuses to delete the default shard.
    pub fn destroy_shard(&self, id: ShardId) -> ShardResult<bool> {
        let removed = self.store.delete_shard(id)?;
        self.invalidate(id);
        Ok(removed)
    }
}

impl ShardResolver for ShardRegistry {
    fn resolve_shard(&self, id: ShardId) -> ShardResult<Option<Shard>> {
        self.lookup(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruKvCache;
    use crate::store::MemoryShardStore;
    use std::sync::{OnceLock, Weak};

    fn id(value: i64) -> ShardId {
        ShardId::new(value).unwrap()
    }

    fn registry_with(store: &Arc<MemoryShardStore>) -> ShardRegistry {
        ShardRegistry::new(store.clone(), RegistryConfig::default())
    }

    #[test]
    fn lookup_caches_hits_and_misses() {
        let store = Arc::new(MemoryShardStore::new());
        store
            .create_shard(ShardParams::on_server("db1").with_id(id(10)))
            .unwrap();
        let registry = registry_with(&store);

        assert_eq!(registry.lookup(id(10)).unwrap().unwrap().id(), Some(id(10)));
        assert_eq!(registry.lookup(id(99)).unwrap(), None);
        let queries = store.query_count();
        registry.lookup(id(10)).unwrap();
        registry.lookup(id(99)).unwrap();
        assert_eq!(store.query_count(), queries);

        registry.clear_cache();
        registry.lookup(id(10)).unwrap();
        assert_eq!(store.query_count(), queries + 1);
    }

    #[test]
    fn require_fails_hard_on_unknown_shard() {
        let store = Arc::new(MemoryShardStore::new());
        let registry = registry_with(&store);
        assert_eq!(registry.require(id(5)), Err(ShardError::UnknownShard(id(5))));
    }

    #[test]
    fn default_falls_back_to_placeholder_without_rows() {
        let store = Arc::new(MemoryShardStore::new());
        let registry = registry_with(&store);
        assert!(registry.default().is_placeholder());

        let real = registry
            .create_shard(ShardParams::on_server("db1").as_default())
            .unwrap();
        assert_eq!(registry.default(), real);
    }

    #[test]
    fn unreachable_store_does_not_cache_failure() {
        let store = Arc::new(MemoryShardStore::new());
        store
            .create_shard(ShardParams::on_server("db1").with_id(id(1)).as_default())
            .unwrap();
        let registry = registry_with(&store);

        store.set_offline(true);
        assert!(registry.default().is_placeholder());
        store.set_offline(false);
        assert_eq!(registry.default().id(), Some(id(1)));
    }

    #[test]
    fn reload_with_fallback_keeps_previous_default() {
        let store = Arc::new(MemoryShardStore::new());
        store
            .create_shard(ShardParams::on_server("db1").with_id(id(1)).as_default())
            .unwrap();
        let registry = registry_with(&store);
        assert_eq!(registry.default().id(), Some(id(1)));

        store.set_offline(true);
        assert_eq!(registry.default_shard(true, true).id(), Some(id(1)));
        assert!(registry.default_shard(true, false).is_placeholder());
    }

    #[test]
    fn second_default_is_rejected() {
        let store = Arc::new(MemoryShardStore::new());
        let registry = registry_with(&store);
        let first = registry
            .create_shard(ShardParams::on_server("db1").as_default())
            .unwrap();
        let err = registry
            .create_shard(ShardParams::on_server("db2").as_default())
            .unwrap_err();
        assert_eq!(
            err,
            ShardError::DuplicateDefault {
                existing: first.id().unwrap()
            }
        );
        assert!(err.is_invariant_violation());

        let mut other = registry.create_shard(ShardParams::on_server("db2")).unwrap();
        other.default = true;
        assert!(matches!(
            registry.update_shard(&other),
            Err(ShardError::DuplicateDefault { .. })
        ));
    }

    #[test]
    fn default_shard_cannot_be_destroyed() {
        let store = Arc::new(MemoryShardStore::new());
        let registry = registry_with(&store);
        let default = registry
            .create_shard(ShardParams::on_server("db1").as_default())
            .unwrap();
        let other = registry.create_shard(ShardParams::on_server("db1")).unwrap();

        let default_id = default.id().unwrap();
        assert_eq!(
            registry.destroy_shard(default_id),
            Err(ShardError::DestroyDefault(default_id))
        );
        assert!(registry.destroy_shard(other.id().unwrap()).unwrap());
        assert_eq!(registry.lookup(other.id().unwrap()).unwrap(), None);
    }

    #[test]
    fn mutations_invalidate_cached_entries() {
        let store = Arc::new(MemoryShardStore::new());
        let registry = registry_with(&store);
        let mut shard = registry
            .create_shard(ShardParams::on_server("db1").with_id(id(3)))
            .unwrap();
        assert_eq!(registry.lookup(id(3)).unwrap().unwrap().name, None);

        shard.name = Some("renamed".to_string());
        registry.update_shard(&shard).unwrap();
        assert_eq!(
            registry.lookup(id(3)).unwrap().unwrap().name.as_deref(),
            Some("renamed")
        );
    }

    #[test]
    fn preload_fills_cache_and_default() {
        let store = Arc::new(MemoryShardStore::new());
        for value in [1, 2, 3] {
            let params = ShardParams::on_server("db1").with_id(id(value));
            let params = if value == 2 { params.as_default() } else { params };
            store.create_shard(params).unwrap();
        }
        let registry = registry_with(&store);
        registry.preload_cache().unwrap();
        let queries = store.query_count();

        assert_eq!(registry.default().id(), Some(id(2)));
        for value in [1, 2, 3] {
            assert!(registry.lookup(id(value)).unwrap().is_some());
        }
        assert_eq!(store.query_count(), queries);
    }

    #[test]
    fn shared_cache_spares_store_queries_across_registries() {
        let store = Arc::new(MemoryShardStore::new());
        store
            .create_shard(ShardParams::on_server("db1").with_id(id(8)))
            .unwrap();
        let shared: SharedShardCache = Arc::new(LruKvCache::new(64));
        let first = registry_with(&store).with_shared_cache(shared.clone());
        let second = registry_with(&store).with_shared_cache(shared);

        first.lookup(id(8)).unwrap();
        let queries = store.query_count();
        assert!(second.lookup(id(8)).unwrap().is_some());
        assert_eq!(store.query_count(), queries);
    }

    #[test]
    fn forked_registry_does_not_touch_parent_cache() {
        let store = Arc::new(MemoryShardStore::new());
        store
            .create_shard(ShardParams::on_server("db1").with_id(id(4)))
            .unwrap();
        let parent = registry_with(&store);
        parent.lookup(id(4)).unwrap();

        let child = parent.fork();
        child.clear_cache();
        assert_eq!(parent.cache().len(), 1);
        assert!(child.cache().is_empty());
    }

    /// Store whose default query asks the registry for the default shard again.
    struct ReentrantStore {
        inner: MemoryShardStore,
        registry: OnceLock<Weak<ShardRegistry>>,
        observed: parking_lot::Mutex<Vec<Shard>>,
    }

    impl ShardStore for ReentrantStore {
        fn find_shard(&self, id: ShardId) -> ShardResult<Option<Shard>> {
            self.inner.find_shard(id)
        }

        fn find_default(&self) -> ShardResult<Option<Shard>> {
            if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
                self.observed.lock().push(registry.default());
            }
            self.inner.find_default()
        }

        fn all_shards(&self) -> ShardResult<Vec<Shard>> {
            self.inner.all_shards()
        }

        fn create_shard(&self, params: ShardParams) -> ShardResult<Shard> {
            self.inner.create_shard(params)
        }

        fn update_shard(&self, shard: &Shard) -> ShardResult<()> {
            self.inner.update_shard(shard)
        }

        fn delete_shard(&self, id: ShardId) -> ShardResult<bool> {
            self.inner.delete_shard(id)
        }
    }

    #[test]
    fn reentrant_default_resolution_gets_provisional_shard() {
        let store = Arc::new(ReentrantStore {
            inner: MemoryShardStore::new(),
            registry: OnceLock::new(),
            observed: parking_lot::Mutex::new(Vec::new()),
        });
        store
            .inner
            .create_shard(ShardParams::on_server("db1").with_id(id(1)).as_default())
            .unwrap();
        let registry = Arc::new(ShardRegistry::new(store.clone(), RegistryConfig::default()));
        let _ = store.registry.set(Arc::downgrade(&registry));

        let default = registry.default();
        assert_eq!(default.id(), Some(id(1)));
        let observed = store.observed.lock();
        assert_eq!(observed.len(), 1);
        assert!(observed[0].is_placeholder());
    }

    #[test]
    fn nested_resolution_on_another_registry_is_not_provisional() {
        let other_store = Arc::new(MemoryShardStore::new());
        other_store
            .create_shard(ShardParams::on_server("db2").with_id(id(7)).as_default())
            .unwrap();
        let other = Arc::new(registry_with(&other_store));

        let store = Arc::new(ReentrantStore {
            inner: MemoryShardStore::new(),
            registry: OnceLock::new(),
            observed: parking_lot::Mutex::new(Vec::new()),
        });
        store
            .inner
            .create_shard(ShardParams::on_server("db1").with_id(id(1)).as_default())
            .unwrap();
        let _ = store.registry.set(Arc::downgrade(&other));
        let registry = ShardRegistry::new(store.clone(), RegistryConfig::default());

        assert_eq!(registry.default().id(), Some(id(1)));
        let observed = store.observed.lock();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].id(), Some(id(7)));
        assert_eq!(other.cache().default_shard().and_then(|s| s.id()), Some(id(7)));
    }
}
