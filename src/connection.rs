//! Connection seam: binds a category to a shard's backing server.

use crate::activation::Category;
use crate::error::{ShardError, ShardResult};
use crate::model::{DatabaseServerId, Shard, ShardId};
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

/// A connection bound to one shard for one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub category: Category,
    /// `None` when bound to the placeholder default shard
    pub shard_id: Option<ShardId>,
    pub server: Option<DatabaseServerId>,
    pub database: String,
}

/// Provides connections for activated shards.
pub trait ConnectionProvider: Send + Sync {
    /// Whether `server` is configured in this environment.
    fn server_exists(&self, server: &DatabaseServerId) -> bool;

    fn bind(&self, category: Category, shard: &Shard) -> ShardResult<ConnectionHandle>;

    /// Drops every open connection. Called before handing work to workers.
    fn clear_all(&self);
}

/// In-memory provider that tracks configured servers and bind/clear activity.
#[derive(Debug, Default)]
pub struct MemoryConnections {
    servers: RwLock<HashSet<DatabaseServerId>>,
    open: Mutex<Vec<ConnectionHandle>>,
    clears: AtomicU64,
}

impl MemoryConnections {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<DatabaseServerId>,
    {
        Self {
            servers: RwLock::new(servers.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn add_server(&self, server: impl Into<DatabaseServerId>) {
        self.servers.write().insert(server.into());
    }

    pub fn remove_server(&self, server: &DatabaseServerId) {
        self.servers.write().remove(server);
    }

    /// Connections bound since the last [`ConnectionProvider::clear_all`].
    pub fn open_connections(&self) -> Vec<ConnectionHandle> {
        self.open.lock().clone()
    }

    pub fn clear_count(&self) -> u64 {
        self.clears.load(Ordering::Relaxed)
    }
}

impl ConnectionProvider for MemoryConnections {
    fn server_exists(&self, server: &DatabaseServerId) -> bool {
        self.servers.read().contains(server)
    }

    fn bind(&self, category: Category, shard: &Shard) -> ShardResult<ConnectionHandle> {
        if let Some(server) = &shard.database_server_id {
            if !self.server_exists(server) {
                return Err(ShardError::UnknownServer(server.to_string()));
            }
        }
        let handle = ConnectionHandle {
            category,
            shard_id: shard.id(),
            server: shard.database_server_id.clone(),
            database: shard.database_name(),
        };
        self.open.lock().push(handle.clone());
        Ok(handle)
    }

    fn clear_all(&self) {
        self.open.lock().clear();
        self.clears.fetch_add(1, Ordering::Relaxed);
    }
}
