//! Default constants for shardkit configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Registry Defaults
// =============================================================================

/// Default number of resolved shards kept in the in-process registry cache
pub const DEFAULT_REGISTRY_CACHE_CAPACITY: usize = 1024;

/// Key under which the default shard is stored in a shared KV cache
pub const DEFAULT_SHARD_CACHE_KEY: &str = "default_shard";

/// Nested default-shard resolutions allowed on one thread before the provisional
/// placeholder is returned instead of querying the store again
pub const DEFAULT_RESOLUTION_DEPTH_LIMIT: usize = 1;

/// Shared KV cache key for a shard row
pub fn shard_cache_key(id: crate::model::ShardId) -> String {
    format!("shard/{}", id)
}

// =============================================================================
// Parallel Fan-out Defaults
// =============================================================================

/// Default number of concurrently running workers (1 = sequential)
pub const DEFAULT_PARALLEL_DEGREE: usize = 1;

/// Largest marshaled worker failure sent in full form (64 KiB).
/// Larger failures are sent in the reduced form.
pub const DEFAULT_MAX_FAILURE_BYTES: usize = 64 * 1024;

/// Backtrace frames kept from the start of a reduced failure
pub const DEFAULT_TRACE_HEAD_FRAMES: usize = 25;

/// Backtrace frames kept from the end of a reduced failure
pub const DEFAULT_TRACE_TAIL_FRAMES: usize = 25;

/// Prefix for worker names; the server id is appended
pub const DEFAULT_WORKER_PREFIX: &str = "shard";

/// Exit status reported for a worker that panicked
pub const WORKER_PANIC_STATUS: i32 = 101;
