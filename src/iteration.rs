//! # Per-Shard Iteration
//!
//! `with_each_shard` runs a block once per shard with that shard activated, collecting
//! the block's output in shard order. How failures are treated is chosen per call with
//! an [`ErrorPolicy`].
//!
//! Shards whose database server is not configured in this environment are skipped, so
//! partial environments (tests, staging) can iterate the full shard table.

use crate::activation::{Bindings, Category, ExecutionContext};
use crate::config::{ErrorPolicyKind, OrderKind, ShardingConfig};
use crate::error::ShardResult;
use crate::fanout::ParallelOptions;
use crate::model::{DatabaseServerId, Shard, ShardId};
use crate::registry::ShardRegistry;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Ordering applied to a [`ShardQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardOrder {
    /// Shards with a server first, grouped by server, then ascending id.
    /// Keeps consecutive shards on the same connection.
    Server,
    /// Ascending shard id
    Id,
    /// Whatever order the store returns
    Unordered,
}

impl From<OrderKind> for ShardOrder {
    fn from(kind: OrderKind) -> Self {
        match kind {
            OrderKind::Server => ShardOrder::Server,
            OrderKind::Id => ShardOrder::Id,
        }
    }
}

impl ShardOrder {
    pub fn apply(self, shards: &mut [Shard]) {
        match self {
            ShardOrder::Server => shards.sort_by(|a, b| {
                let key = |s: &Shard| (s.database_server_id.is_none(), s.database_server_id.clone(), s.id());
                key(a).cmp(&key(b))
            }),
            ShardOrder::Id => shards.sort_by_key(Shard::id),
            ShardOrder::Unordered => {}
        }
    }
}

/// Filter over the shard table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardQuery {
    ids: Option<Vec<ShardId>>,
    servers: Option<Vec<DatabaseServerId>>,
    exclude: Vec<ShardId>,
    order: Option<ShardOrder>,
}

impl ShardQuery {
    /// Every shard.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = ShardId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn on_servers<S: Into<DatabaseServerId>>(mut self, servers: impl IntoIterator<Item = S>) -> Self {
        self.servers = Some(servers.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude(mut self, ids: impl IntoIterator<Item = ShardId>) -> Self {
        self.exclude.extend(ids);
        self
    }

    /// Explicit order; otherwise the caller's default applies.
    pub fn order(mut self, order: ShardOrder) -> Self {
        self.order = Some(order);
        self
    }

    fn matches(&self, shard: &Shard) -> bool {
        let Some(id) = shard.id() else {
            return false;
        };
        if self.exclude.contains(&id) {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&id) {
                return false;
            }
        }
        match (&self.servers, &shard.database_server_id) {
            (Some(servers), Some(server)) => servers.contains(server),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// Matching shards from the registry, ordered.
    pub fn resolve(&self, registry: &ShardRegistry, default_order: ShardOrder) -> ShardResult<Vec<Shard>> {
        let mut shards: Vec<Shard> = registry
            .all_shards()?
            .into_iter()
            .filter(|shard| self.matches(shard))
            .collect();
        self.order.unwrap_or(default_order).apply(&mut shards);
        Ok(shards)
    }
}

/// What to iterate: an explicit, already ordered list, or a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardScope {
    Shards(Vec<Shard>),
    Query(ShardQuery),
}

impl From<Vec<Shard>> for ShardScope {
    fn from(shards: Vec<Shard>) -> Self {
        ShardScope::Shards(shards)
    }
}

impl From<&[Shard]> for ShardScope {
    fn from(shards: &[Shard]) -> Self {
        ShardScope::Shards(shards.to_vec())
    }
}

impl From<ShardQuery> for ShardScope {
    fn from(query: ShardQuery) -> Self {
        ShardScope::Query(query)
    }
}

/// Custom failure handler. Returning `Err` aborts the iteration with that error.
pub type FailureHandler = Arc<dyn Fn(&Shard, &anyhow::Error) -> anyhow::Result<()> + Send + Sync>;

/// How `with_each_shard` treats a failing block.
#[derive(Clone, Default)]
pub enum ErrorPolicy {
    /// Abort on the first failure; results so far are discarded
    #[default]
    Raise,
    /// Swallow failures and continue
    Ignore,
    /// Continue through every shard, then return the first failure
    Defer,
    /// Hand each failure to a handler instead of raising or recording it
    Handler(FailureHandler),
}

impl ErrorPolicy {
    pub fn handler<H>(handler: H) -> Self
    where
        H: Fn(&Shard, &anyhow::Error) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        ErrorPolicy::Handler(Arc::new(handler))
    }
}

impl From<ErrorPolicyKind> for ErrorPolicy {
    fn from(kind: ErrorPolicyKind) -> Self {
        match kind {
            ErrorPolicyKind::Raise => ErrorPolicy::Raise,
            ErrorPolicyKind::Ignore => ErrorPolicy::Ignore,
            ErrorPolicyKind::Defer => ErrorPolicy::Defer,
        }
    }
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Raise => f.write_str("Raise"),
            ErrorPolicy::Ignore => f.write_str("Ignore"),
            ErrorPolicy::Defer => f.write_str("Defer"),
            ErrorPolicy::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// Options for one `with_each_shard` call.
#[derive(Debug, Clone)]
pub struct EachShardOptions {
    /// Categories bound to each shard in turn
    pub categories: Vec<Category>,
    pub error_policy: ErrorPolicy,
    /// Order for queries that do not pick one
    pub default_order: ShardOrder,
}

impl Default for EachShardOptions {
    fn default() -> Self {
        Self {
            categories: vec![Category::PRIMARY],
            error_policy: ErrorPolicy::Raise,
            default_order: ShardOrder::Server,
        }
    }
}

impl EachShardOptions {
    pub fn from_config(config: &ShardingConfig) -> Self {
        Self {
            categories: vec![Category::PRIMARY],
            error_policy: config.iteration.error_policy.into(),
            default_order: config.iteration.default_order.into(),
        }
    }

    pub fn categories(mut self, categories: &[Category]) -> Self {
        self.categories = categories.to_vec();
        self
    }

    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Wraps these options for [`with_each_shard_parallel`](ExecutionContext::with_each_shard_parallel).
    pub fn parallel(self, degree: usize) -> ParallelOptions {
        ParallelOptions::new(self, degree)
    }
}

/// Output of a per-shard block, flattened into the combined result.
///
/// Collections contribute their items, `None` and `()` contribute nothing, and plain
/// values contribute themselves. Primitives, strings, pairs and triples are covered
/// directly; wrap any other single value in [`Single`].
///
/// ```
/// use shardkit_rs::Single;
///
/// #[derive(Debug, PartialEq)]
/// struct Usage { rows: u64 }
///
/// let block = || -> anyhow::Result<Single<Usage>> { Ok(Single(Usage { rows: 3 })) };
/// # let _ = block;
/// ```
pub trait ShardOutput {
    type Item;

    fn into_items(self) -> Vec<Self::Item>;
}

impl<T> ShardOutput for Vec<T> {
    type Item = T;

    fn into_items(self) -> Vec<T> {
        self
    }
}

impl<T> ShardOutput for Option<T> {
    type Item = T;

    fn into_items(self) -> Vec<T> {
        self.into_iter().collect()
    }
}

impl ShardOutput for () {
    type Item = ();

    fn into_items(self) -> Vec<()> {
        Vec::new()
    }
}

macro_rules! single_output {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ShardOutput for $ty {
                type Item = $ty;

                fn into_items(self) -> Vec<$ty> {
                    vec![self]
                }
            }
        )*
    };
}

single_output!(
    bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64,
    String, &'static str, Shard, ShardId,
);

/// One value of any type, contributed as a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Single<T>(pub T);

impl<T> ShardOutput for Single<T> {
    type Item = T;

    fn into_items(self) -> Vec<T> {
        vec![self.0]
    }
}

impl<A, B> ShardOutput for (A, B) {
    type Item = (A, B);

    fn into_items(self) -> Vec<(A, B)> {
        vec![self]
    }
}

impl<A, B, C> ShardOutput for (A, B, C) {
    type Item = (A, B, C);

    fn into_items(self) -> Vec<(A, B, C)> {
        vec![self]
    }
}

impl ExecutionContext {
    /// Runs `f` once per shard in `scope` with `options.categories` bound to that shard.
    ///
    /// Returns the concatenated outputs in shard order. Failures follow
    /// `options.error_policy`. Always runs on the calling thread; fan-out goes through
    /// [`with_each_shard_parallel`](Self::with_each_shard_parallel).
    #[instrument(level = "debug", skip_all, fields(policy = ?options.error_policy))]
    pub fn with_each_shard<F, O>(
        &mut self,
        scope: impl Into<ShardScope>,
        options: &EachShardOptions,
        mut f: F,
    ) -> anyhow::Result<Vec<O::Item>>
    where
        F: FnMut(&mut ExecutionContext, &Shard) -> anyhow::Result<O>,
        O: ShardOutput,
    {
        let shards = self.resolve_scope(scope.into(), options)?;
        self.run_each_shard(shards, options, &mut f)
    }

    /// Resolves `scope` to the shards that can run here, in order.
    pub(crate) fn resolve_scope(
        &self,
        scope: ShardScope,
        options: &EachShardOptions,
    ) -> ShardResult<Vec<Shard>> {
        let shards = match scope {
            ShardScope::Shards(shards) => shards,
            ShardScope::Query(query) => query.resolve(self.registry(), options.default_order)?,
        };
        let connections = self.sharding().connections();
        Ok(shards
            .into_iter()
            .filter(|shard| {
                let available = match &shard.database_server_id {
                    Some(server) => connections.server_exists(server),
                    None => shard.is_placeholder(),
                };
                if !available {
                    debug!(%shard, server = ?shard.database_server_id, "skipping shard without configured server");
                }
                available
            })
            .collect())
    }

    pub(crate) fn run_each_shard<F, O>(
        &mut self,
        shards: Vec<Shard>,
        options: &EachShardOptions,
        f: &mut F,
    ) -> anyhow::Result<Vec<O::Item>>
    where
        F: FnMut(&mut ExecutionContext, &Shard) -> anyhow::Result<O>,
        O: ShardOutput,
    {
        let mut results = Vec::new();
        let mut deferred: Option<anyhow::Error> = None;

        for shard in &shards {
            let bindings = Bindings::all(&options.categories, shard);
            match self.activate(&bindings, |ctx| f(ctx, shard)) {
                Ok(output) => results.extend(output.into_items()),
                Err(err) => match &options.error_policy {
                    ErrorPolicy::Raise => return Err(err),
                    ErrorPolicy::Ignore => {
                        warn!(%shard, error = %err, "ignoring failure");
                    }
                    ErrorPolicy::Defer => {
                        warn!(%shard, error = %err, "deferring failure");
                        deferred.get_or_insert(err);
                    }
                    ErrorPolicy::Handler(handler) => handler(shard, &err)?,
                },
            }
        }

        match deferred {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}
