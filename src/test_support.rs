use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::activation::ExecutionContext;
use crate::config::ShardingConfig;
use crate::connection::MemoryConnections;
use crate::fanout::WorkerSpawner;
use crate::model::{Shard, ShardId, ShardParams};
use crate::store::{MemoryShardStore, ShardStore};
use crate::Sharding;

/// In-memory sharding setup: a store, a connection provider and the started context.
pub struct Fixture {
    pub sharding: Arc<Sharding>,
    pub store: Arc<MemoryShardStore>,
    pub connections: Arc<MemoryConnections>,
}

impl Fixture {
    /// `layout` lists each database server with the shard ids it hosts.
    pub fn new(layout: &[(&str, &[i64])], default: Option<i64>) -> Self {
        Self::build(layout, default, ShardingConfig::default(), None)
    }

    pub fn with_config(layout: &[(&str, &[i64])], default: Option<i64>, config: ShardingConfig) -> Self {
        Self::build(layout, default, config, None)
    }

    pub fn with_spawner(
        layout: &[(&str, &[i64])],
        default: Option<i64>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        Self::build(layout, default, ShardingConfig::default(), Some(spawner))
    }

    fn build(
        layout: &[(&str, &[i64])],
        default: Option<i64>,
        config: ShardingConfig,
        spawner: Option<Arc<dyn WorkerSpawner>>,
    ) -> Self {
        let store = Arc::new(MemoryShardStore::new());
        for (server, ids) in layout {
            for &id in ids.iter() {
                let mut params = ShardParams::on_server(*server)
                    .with_id(ShardId::new(id).expect("valid fixture shard id"))
                    .named(format!("shard_{}", id));
                if default == Some(id) {
                    params = params.as_default();
                }
                store.create_shard(params).expect("create fixture shard");
            }
        }
        let connections = Arc::new(MemoryConnections::new(layout.iter().map(|(server, _)| *server)));

        let mut sharding = Sharding::new(store.clone(), connections.clone(), config);
        if let Some(spawner) = spawner {
            sharding = sharding.with_spawner(spawner);
        }
        Self {
            sharding: sharding.start().expect("start sharding"),
            store,
            connections,
        }
    }

    pub fn shard(&self, id: i64) -> Shard {
        let id = ShardId::new(id).expect("valid shard id");
        self.sharding.registry().require(id).expect("fixture shard")
    }

    pub fn context(&self) -> ExecutionContext {
        self.sharding.context()
    }

    /// Context whose stdout and stderr are captured in the returned buffers.
    pub fn capturing_context(&self) -> (ExecutionContext, SharedBuffer, SharedBuffer) {
        let out = SharedBuffer::default();
        let err = SharedBuffer::default();
        let ctx = ExecutionContext::with_output(
            Arc::clone(&self.sharding),
            Box::new(out.clone()),
            Box::new(err.clone()),
        );
        (ctx, out, err)
    }
}

/// Cloneable in-memory writer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
