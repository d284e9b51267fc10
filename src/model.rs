//! # Data Model
//!
//! Shards, the database servers backing them, and their identifiers.

use crate::error::{ShardError, ShardResult};
use crate::ids::IDS_PER_SHARD;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Largest shard id whose global ids still fit in an `i64`.
pub const MAX_SHARD_ID: i64 = i64::MAX / IDS_PER_SHARD - 1;

/// Identifier of a persisted shard. Always in `1..=MAX_SHARD_ID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct ShardId(i64);

impl ShardId {
    /// Validates a raw shard id. Zero is reserved and never names a shard.
    pub fn new(value: i64) -> ShardResult<Self> {
        if (1..=MAX_SHARD_ID).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ShardError::InvalidShardId(value))
        }
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for ShardId {
    type Error = ShardError;

    fn try_from(value: i64) -> ShardResult<Self> {
        Self::new(value)
    }
}

impl From<ShardId> for i64 {
    fn from(id: ShardId) -> Self {
        id.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the connection group (database server) a shard lives on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseServerId(pub String);

impl DatabaseServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseServerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum ShardKind {
    Persisted(ShardId),
    /// Stand-in default used before any real default shard row exists.
    Placeholder,
}

/// One partition of the dataset.
///
/// Equality and hashing follow the shard's identity only, so a shard loaded before and
/// after an update compares equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    kind: ShardKind,
    /// Explicit database name; `None` uses the server's naming convention
    pub name: Option<String>,
    /// Backing connection group
    pub database_server_id: Option<DatabaseServerId>,
    /// Whether this is the default shard
    pub default: bool,
}

impl Shard {
    pub fn new(
        id: ShardId,
        name: Option<String>,
        database_server_id: Option<DatabaseServerId>,
        default: bool,
    ) -> Self {
        Self {
            kind: ShardKind::Persisted(id),
            name,
            database_server_id,
            default,
        }
    }

    /// The non-persisted default shard.
    pub fn placeholder() -> Self {
        Self {
            kind: ShardKind::Placeholder,
            name: None,
            database_server_id: None,
            default: true,
        }
    }

    /// Persisted id, `None` for the placeholder.
    pub fn id(&self) -> Option<ShardId> {
        match self.kind {
            ShardKind::Persisted(id) => Some(id),
            ShardKind::Placeholder => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == ShardKind::Placeholder
    }

    pub fn is_default(&self) -> bool {
        self.default
    }

    /// Same identity and same attributes, unlike `==` which compares identity only.
    pub fn same_record(&self, other: &Shard) -> bool {
        self == other
            && self.name == other.name
            && self.database_server_id == other.database_server_id
            && self.default == other.default
    }

    /// Database name, falling back to `<server>_shard_<id>`.
    pub fn database_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match (self.id(), &self.database_server_id) {
            (Some(id), Some(server)) => format!("{}_shard_{}", server, id),
            (Some(id), None) => format!("shard_{}", id),
            (None, _) => "default".to_string(),
        }
    }

    /// Composes a global id for a local id on this shard.
    ///
    /// Values already in global range pass through unchanged, as does everything on the
    /// placeholder, which has no number to encode.
    pub fn global_id_for(&self, local_id: i64) -> i64 {
        match self.kind {
            ShardKind::Placeholder => local_id,
            ShardKind::Persisted(_) if local_id.unsigned_abs() >= IDS_PER_SHARD as u64 => local_id,
            ShardKind::Persisted(id) => {
                let composed = id.get() * IDS_PER_SHARD + local_id.abs();
                if local_id < 0 {
                    -composed
                } else {
                    composed
                }
            }
        }
    }
}

impl PartialEq for Shard {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Shard {}

impl Hash for Shard {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ShardKind::Persisted(id) => write!(f, "shard {}", id),
            ShardKind::Placeholder => f.write_str("shard default (placeholder)"),
        }
    }
}

/// Attributes for creating a shard.
#[derive(Debug, Clone, Default)]
pub struct ShardParams {
    /// Explicit id; the store assigns the next free one when `None`
    pub id: Option<ShardId>,
    pub name: Option<String>,
    pub database_server_id: Option<DatabaseServerId>,
    pub default: bool,
}

impl ShardParams {
    pub fn on_server(server: impl Into<DatabaseServerId>) -> Self {
        Self {
            database_server_id: Some(server.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: ShardId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}
