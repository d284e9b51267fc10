//! # Shardkit
//!
//! Horizontal sharding identity and execution context for multi-tenant data stores.
//!
//! - [`ids`]: global ids that embed a shard id and a shard-local id in one integer.
//! - [`registry`]: cached resolution of shard ids to shards, and the default shard.
//! - [`activation`]: re-entrant, per-category stacks of active shards.
//! - [`iteration`]: `with_each_shard`, running a block once per shard with error policies.
//! - [`fanout`]: the same iteration spread over isolated workers, one per database server.
//!
//! [`Sharding`] is the process-scoped context tying the collaborators together; each thread
//! of execution works through its own [`ExecutionContext`].

pub mod activation;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod ids;
pub mod iteration;
pub mod model;
pub mod registry;
pub mod store;
pub mod test_support;

// Re-export main types for convenience
pub use activation::{ActivationGuard, ActivationStack, Bindings, Category, ExecutionContext, ShardRef};
pub use config::ShardingConfig;
pub use connection::{ConnectionHandle, ConnectionProvider, MemoryConnections};
pub use error::{MarshaledFailure, ShardError, ShardResult};
pub use fanout::{ParallelOptions, ThreadSpawner, WorkerSpawner};
pub use ids::{IdInput, Identified, LocalId, ShortId, IDS_PER_SHARD};
pub use iteration::{
    EachShardOptions, ErrorPolicy, ShardOrder, ShardOutput, ShardQuery, ShardScope, Single,
};
pub use model::{DatabaseServerId, Shard, ShardId, ShardParams};
pub use registry::ShardRegistry;
pub use store::{MemoryShardStore, ShardStore};

use registry::SharedShardCache;
use std::sync::Arc;
use tracing::info;

/// Process-scoped sharding context: registry, connections, worker spawner and config.
///
/// Built once per process and shared behind an `Arc`. Workers receive a [`fork`](Self::fork)
/// with their own registry cache.
pub struct Sharding {
    registry: ShardRegistry,
    connections: Arc<dyn ConnectionProvider>,
    spawner: Arc<dyn WorkerSpawner>,
    config: ShardingConfig,
}

impl Sharding {
    pub fn new(
        store: Arc<dyn ShardStore>,
        connections: Arc<dyn ConnectionProvider>,
        config: ShardingConfig,
    ) -> Self {
        Self {
            registry: ShardRegistry::new(store, config.registry.clone()),
            connections,
            spawner: Arc::new(ThreadSpawner::new()),
            config,
        }
    }

    /// Adds a shared KV cache in front of the shard store.
    pub fn with_shared_cache(mut self, cache: SharedShardCache) -> Self {
        self.registry = self.registry.with_shared_cache(cache);
        self
    }

    /// Replaces the worker spawner used for parallel fan-out.
    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Finishes setup, preloading the registry when configured to.
    pub fn start(self) -> ShardResult<Arc<Self>> {
        if self.config.registry.preload {
            self.registry.preload_cache()?;
            info!(
                cached = self.registry.cache().len(),
                "shard registry preloaded"
            );
        }
        Ok(Arc::new(self))
    }

    /// A fresh execution context for the calling thread.
    pub fn context(self: &Arc<Self>) -> ExecutionContext {
        ExecutionContext::new(Arc::clone(self))
    }

    /// Copy for a worker: same collaborators, independent registry cache.
    pub fn fork(&self) -> Arc<Self> {
        Arc::new(Self {
            registry: self.registry.fork(),
            connections: Arc::clone(&self.connections),
            spawner: Arc::clone(&self.spawner),
            config: self.config.clone(),
        })
    }

    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<dyn ConnectionProvider> {
        &self.connections
    }

    pub fn spawner(&self) -> &Arc<dyn WorkerSpawner> {
        &self.spawner
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }
}
