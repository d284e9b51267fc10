//! Unified configuration for shardkit.
//!
//! Configuration is loaded with precedence: overrides > Env vars > Config file > Defaults
//!
//! # Example config file (shardkit.toml)
//! ```toml
//! [registry]
//! cache_capacity = 4096
//! preload = true
//!
//! [iteration]
//! error_policy = "defer"
//! default_order = "server"
//!
//! [parallel]
//! degree = 4
//! max_failure_bytes = 65536
//! ```
//!
//! Environment variables use the `SHARDKIT_` prefix with `__` between sections,
//! e.g. `SHARDKIT_PARALLEL__DEGREE=8`.

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Shard registry caching
    pub registry: RegistryConfig,
    /// Defaults for `with_each_shard`
    pub iteration: IterationConfig,
    /// Parallel fan-out
    pub parallel: ParallelConfig,
}

impl ShardingConfig {
    /// Load configuration with precedence: overrides > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - Overrides to apply on top
    pub fn load(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(ShardingConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with SHARDKIT_ prefix
        figment = figment.merge(Env::prefixed("SHARDKIT_").split("__"));

        // Layer 3: overrides
        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no overrides)
    pub fn from_env(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Resolved shards kept in the in-process cache
    pub cache_capacity: usize,
    /// Load every shard into the cache at startup
    pub preload: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_REGISTRY_CACHE_CAPACITY,
            preload: false,
        }
    }
}

/// Error policy names usable from configuration.
///
/// Custom handlers can only be installed in code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicyKind {
    /// Abort on the first failure
    #[default]
    Raise,
    /// Swallow failures and keep going
    Ignore,
    /// Visit every shard, then raise the first failure
    Defer,
}

/// Default shard ordering for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OrderKind {
    /// Group by database server, then by id
    #[default]
    Server,
    /// Ascending shard id
    Id,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationConfig {
    pub error_policy: ErrorPolicyKind,
    pub default_order: OrderKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Concurrently running workers; 1 disables fan-out
    pub degree: usize,
    /// Size ceiling for a full-form marshaled failure
    pub max_failure_bytes: usize,
    /// Backtrace frames kept from the start of a reduced failure
    pub trace_head_frames: usize,
    /// Backtrace frames kept from the end of a reduced failure
    pub trace_tail_frames: usize,
    /// Worker name prefix
    pub worker_prefix: String,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            degree: DEFAULT_PARALLEL_DEGREE,
            max_failure_bytes: DEFAULT_MAX_FAILURE_BYTES,
            trace_head_frames: DEFAULT_TRACE_HEAD_FRAMES,
            trace_tail_frames: DEFAULT_TRACE_TAIL_FRAMES,
            worker_prefix: DEFAULT_WORKER_PREFIX.to_string(),
        }
    }
}

/// Overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preload: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<ErrorPolicyKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_order: Option<OrderKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degree: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_failure_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_prefix: Option<String>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
