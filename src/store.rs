//! # Store Module
//!
//! Persistence seam for shard rows, plus an in-memory implementation used by tests,
//! benches and single-process deployments.

use crate::error::{ShardError, ShardResult};
use crate::model::{Shard, ShardId, ShardParams};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Backing store for shard rows.
///
/// Implementations report an unreachable backend as [`ShardError::StoreUnavailable`].
///
/// Stores own the single-default invariant and must check it atomically with the write
/// (a transaction, a unique partial index, or a lock held across check and write):
/// creating or updating a second default row fails with [`ShardError::DuplicateDefault`],
/// deleting the default row fails with [`ShardError::DestroyDefault`]. The registry does
/// not repeat these checks.
pub trait ShardStore: Send + Sync {
    fn find_shard(&self, id: ShardId) -> ShardResult<Option<Shard>>;

    /// The row flagged default, if any.
    fn find_default(&self) -> ShardResult<Option<Shard>>;

    fn all_shards(&self) -> ShardResult<Vec<Shard>>;

    fn create_shard(&self, params: ShardParams) -> ShardResult<Shard>;

    /// Overwrites the row with the same id.
    fn update_shard(&self, shard: &Shard) -> ShardResult<()>;

    /// Returns whether a row was removed.
    fn delete_shard(&self, id: ShardId) -> ShardResult<bool>;
}

#[derive(Debug, Default)]
struct Rows {
    shards: BTreeMap<ShardId, Shard>,
    next_id: i64,
}

impl Rows {
    /// Id of the default row other than `except`.
    fn other_default(&self, except: Option<ShardId>) -> Option<ShardId> {
        self.shards
            .values()
            .filter(|shard| shard.default)
            .filter_map(Shard::id)
            .find(|id| Some(*id) != except)
    }
}

/// In-memory shard store.
///
/// Counts queries so callers can observe cache effectiveness, and can be switched
/// offline to simulate an unreachable backend.
#[derive(Debug, Default)]
pub struct MemoryShardStore {
    rows: RwLock<Rows>,
    offline: AtomicBool,
    queries: AtomicU64,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of read queries served so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.rows.read().shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> ShardResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ShardError::StoreUnavailable(
                "memory store is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn read_query(&self) -> ShardResult<()> {
        self.check_online()?;
        self.queries.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl ShardStore for MemoryShardStore {
    fn find_shard(&self, id: ShardId) -> ShardResult<Option<Shard>> {
        self.read_query()?;
        Ok(self.rows.read().shards.get(&id).cloned())
    }

    fn find_default(&self) -> ShardResult<Option<Shard>> {
        self.read_query()?;
        Ok(self
            .rows
            .read()
            .shards
            .values()
            .find(|shard| shard.default)
            .cloned())
    }

    fn all_shards(&self) -> ShardResult<Vec<Shard>> {
        self.read_query()?;
        Ok(self.rows.read().shards.values().cloned().collect())
    }

    fn create_shard(&self, params: ShardParams) -> ShardResult<Shard> {
        self.check_online()?;
        let mut rows = self.rows.write();
        if params.default {
            if let Some(existing) = rows.other_default(None) {
                return Err(ShardError::DuplicateDefault { existing });
            }
        }
        let id = match params.id {
            Some(id) => id,
            None => {
                let last = rows.shards.keys().next_back().map_or(0, |id| id.get());
                ShardId::new(rows.next_id.max(last) + 1)?
            }
        };
        if rows.shards.contains_key(&id) {
            return Err(ShardError::ShardExists(id));
        }
        rows.next_id = rows.next_id.max(id.get());
        let shard = Shard::new(id, params.name, params.database_server_id, params.default);
        rows.shards.insert(id, shard.clone());
        Ok(shard)
    }

    fn update_shard(&self, shard: &Shard) -> ShardResult<()> {
        self.check_online()?;
        let Some(id) = shard.id() else {
            return Err(ShardError::InvalidShardId(0));
        };
        let mut rows = self.rows.write();
        if shard.default {
            if let Some(existing) = rows.other_default(Some(id)) {
                return Err(ShardError::DuplicateDefault { existing });
            }
        }
        match rows.shards.get_mut(&id) {
            Some(row) => {
                *row = shard.clone();
                Ok(())
            }
            None => Err(ShardError::UnknownShard(id)),
        }
    }

    fn delete_shard(&self, id: ShardId) -> ShardResult<bool> {
        self.check_online()?;
        let mut rows = self.rows.write();
        if rows.shards.get(&id).is_some_and(|shard| shard.default) {
            return Err(ShardError::DestroyDefault(id));
        }
        Ok(rows.shards.remove(&id).is_some())
    }
}
