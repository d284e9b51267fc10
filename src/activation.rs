//! # Shard Activation
//!
//! Which shard is active is explicit execution context, not a global. Each
//! [`ExecutionContext`] owns an [`ActivationStack`]: one stack of shards per
//! [`Category`]. The top of a category's stack is its active shard; a category with no
//! frames resolves to the default shard.
//!
//! [`ExecutionContext::activate`] pushes frames for the duration of a closure and pops
//! them on every exit path, panics included, through [`ActivationGuard`].
//!
//! Contexts are not shared between threads. Every thread (or worker) builds its own from
//! the process-wide [`Sharding`].

use crate::connection::ConnectionHandle;
use crate::error::{ShardError, ShardResult};
use crate::ids::{self, IdInput, LocalId, ShortId};
use crate::model::{Shard, ShardId};
use crate::registry::ShardRegistry;
use crate::Sharding;
use hashbrown::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A logical group of record types that share a shard binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Category(&'static str);

impl Category {
    /// The category every sharded record type belongs to unless told otherwise.
    pub const PRIMARY: Category = Category("primary");

    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Category-to-shard assignments for one activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    entries: Vec<(Category, Shard)>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `category` to `shard`, replacing an earlier binding of the same category.
    pub fn bind(mut self, category: Category, shard: Shard) -> Self {
        match self.entries.iter_mut().find(|(existing, _)| *existing == category) {
            Some(entry) => entry.1 = shard,
            None => self.entries.push((category, shard)),
        }
        self
    }

    /// Binds only [`Category::PRIMARY`].
    pub fn primary(shard: Shard) -> Self {
        Self::new().bind(Category::PRIMARY, shard)
    }

    /// Binds every category in `categories` to the same shard.
    pub fn all(categories: &[Category], shard: &Shard) -> Self {
        categories
            .iter()
            .fold(Self::new(), |bindings, category| {
                bindings.bind(*category, shard.clone())
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Category, Shard)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-category stacks of active shards.
#[derive(Debug, Default)]
pub struct ActivationStack {
    frames: HashMap<Category, Vec<Shard>>,
}

impl ActivationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, category: Category, shard: Shard) {
        self.frames.entry(category).or_default().push(shard);
    }

    pub fn pop(&mut self, category: Category) -> Option<Shard> {
        let frames = self.frames.get_mut(&category)?;
        let shard = frames.pop();
        if frames.is_empty() {
            self.frames.remove(&category);
        }
        shard
    }

    /// The active shard for `category`, if it has any frames.
    pub fn top(&self, category: Category) -> Option<&Shard> {
        self.frames.get(&category).and_then(|frames| frames.last())
    }

    pub fn depth(&self, category: Category) -> usize {
        self.frames.get(&category).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = Category> + '_ {
        self.frames.keys().copied()
    }
}

/// Token forms accepted by [`ExecutionContext::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardRef {
    /// The shard active for [`Category::PRIMARY`] (`"self"`)
    Current,
    /// The default shard (`"default"`, `0`)
    Default,
    Id(ShardId),
}

impl ShardRef {
    pub fn parse(token: &str) -> ShardResult<Self> {
        match token {
            "self" => Ok(Self::Current),
            "default" => Ok(Self::Default),
            other => {
                let raw: i64 = other
                    .parse()
                    .map_err(|_| ShardError::unparseable(other))?;
                Self::try_from(raw)
            }
        }
    }
}

impl From<ShardId> for ShardRef {
    fn from(id: ShardId) -> Self {
        Self::Id(id)
    }
}

impl TryFrom<i64> for ShardRef {
    type Error = ShardError;

    fn try_from(raw: i64) -> ShardResult<Self> {
        if raw == 0 {
            Ok(Self::Default)
        } else {
            ShardId::new(raw).map(Self::Id)
        }
    }
}

/// Frames pushed by [`ExecutionContext::activate_unscoped`], to hand back to
/// [`ExecutionContext::release`].
#[derive(Debug)]
#[must_use = "unscoped frames stay active until released"]
pub struct PushedFrames {
    categories: Vec<Category>,
}

impl PushedFrames {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Execution context of one thread or worker: its activation stack and output streams.
pub struct ExecutionContext {
    sharding: Arc<Sharding>,
    stack: ActivationStack,
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    /// Fresh context writing to the process's stdout and stderr.
    pub fn new(sharding: Arc<Sharding>) -> Self {
        Self::with_output(sharding, Box::new(io::stdout()), Box::new(io::stderr()))
    }

    pub fn with_output(
        sharding: Arc<Sharding>,
        out: Box<dyn Write + Send>,
        err: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            sharding,
            stack: ActivationStack::new(),
            out,
            err,
        }
    }

    pub fn sharding(&self) -> &Arc<Sharding> {
        &self.sharding
    }

    pub fn registry(&self) -> &ShardRegistry {
        self.sharding.registry()
    }

    pub fn stack(&self) -> &ActivationStack {
        &self.stack
    }

    /// Standard output for this context; proxied to the coordinator inside workers.
    pub fn out(&mut self) -> &mut (dyn Write + Send) {
        self.out.as_mut()
    }

    /// Standard error for this context; proxied to the coordinator inside workers.
    pub fn err(&mut self) -> &mut (dyn Write + Send) {
        self.err.as_mut()
    }

    /// Active shard for `category`, or the default shard when nothing is bound.
    pub fn current(&self, category: Category) -> Shard {
        match self.stack.top(category) {
            Some(shard) => shard.clone(),
            None => self.registry().default(),
        }
    }

    /// Active shard for [`Category::PRIMARY`].
    pub fn current_shard(&self) -> Shard {
        self.current(Category::PRIMARY)
    }

    /// Every explicitly bound category with its active shard.
    pub fn current_shards(&self) -> Vec<(Category, Shard)> {
        let mut active: Vec<_> = self
            .stack
            .categories()
            .filter_map(|category| self.stack.top(category).map(|s| (category, s.clone())))
            .collect();
        active.sort_by_key(|(category, _)| *category);
        active
    }

    /// Resolves `"self"`, `"default"`/`0` or a shard id.
    pub fn lookup(&self, shard_ref: impl Into<ShardRef>) -> ShardResult<Option<Shard>> {
        match shard_ref.into() {
            ShardRef::Current => Ok(Some(self.current_shard())),
            ShardRef::Default => Ok(Some(self.registry().default())),
            ShardRef::Id(id) => {
                let current = self.current_shard();
                if current.id() == Some(id) {
                    return Ok(Some(current));
                }
                self.registry().lookup(id)
            }
        }
    }

    /// Runs `f` with `bindings` active, restoring the previous bindings afterwards.
    ///
    /// Categories already bound to the requested shard get no new frame. Frames are popped
    /// in reverse order whether `f` returns, fails or panics.
    pub fn activate<T, F>(&mut self, bindings: &Bindings, f: F) -> T
    where
        F: FnOnce(&mut ExecutionContext) -> T,
    {
        let mut guard = self.activate_scoped(bindings);
        f(&mut guard)
    }

    /// Guard-based form of [`activate`](Self::activate): the bindings stay active until
    /// the guard is dropped.
    pub fn activate_scoped(&mut self, bindings: &Bindings) -> ActivationGuard<'_> {
        let pushed = self.push_bindings(bindings);
        ActivationGuard { ctx: self, pushed }
    }

    /// Pushes `bindings` without popping them.
    ///
    /// For interactive and manual use only; library code must use [`activate`](Self::activate).
    /// The caller unwinds with [`release`](Self::release), and must do so before any
    /// enclosing scoped activation ends.
    pub fn activate_unscoped(&mut self, bindings: &Bindings) -> PushedFrames {
        PushedFrames {
            categories: self.push_bindings(bindings),
        }
    }

    /// Pops frames pushed by [`activate_unscoped`](Self::activate_unscoped).
    pub fn release(&mut self, frames: PushedFrames) {
        self.pop_frames(&frames.categories);
    }

    fn push_bindings(&mut self, bindings: &Bindings) -> Vec<Category> {
        let mut pushed = Vec::with_capacity(bindings.len());
        for (category, shard) in bindings.iter() {
            if self.current(*category).same_record(shard) {
                continue;
            }
            self.stack.push(*category, shard.clone());
            pushed.push(*category);
        }
        pushed
    }

    fn pop_frames(&mut self, categories: &[Category]) {
        for category in categories.iter().rev() {
            self.stack.pop(*category);
        }
    }

    /// Connection for the shard active on `category`.
    pub fn connection(&self, category: Category) -> ShardResult<ConnectionHandle> {
        let shard = self.current(category);
        self.sharding.connections().bind(category, &shard)
    }

    /// [`ids::local_id_for`] through this context's registry.
    pub fn local_id_for<'a>(&self, value: impl Into<IdInput<'a>>) -> ShardResult<Option<LocalId>> {
        ids::local_id_for(self.registry(), value)
    }

    /// [`ids::global_id_for`] with the current shard as the source of local ids.
    pub fn global_id_for<'a>(&self, value: impl Into<IdInput<'a>>) -> ShardResult<i64> {
        ids::global_id_for(value, &self.current_shard())
    }

    /// [`ids::relative_id_for`] from the current shard to `target_shard`.
    pub fn relative_id_for<'a>(
        &self,
        value: impl Into<IdInput<'a>>,
        target_shard: &Shard,
    ) -> ShardResult<i64> {
        ids::relative_id_for(self.registry(), value, &self.current_shard(), target_shard)
    }

    pub fn short_id_for<'a>(&self, value: impl Into<IdInput<'a>>) -> ShardResult<ShortId> {
        ids::short_id_for(self.registry(), value)
    }
}

/// Keeps an activation alive; pops its frames when dropped.
pub struct ActivationGuard<'a> {
    ctx: &'a mut ExecutionContext,
    pushed: Vec<Category>,
}

impl ActivationGuard<'_> {
    /// Number of frames this activation actually pushed.
    pub fn pushed(&self) -> usize {
        self.pushed.len()
    }
}

impl Deref for ActivationGuard<'_> {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        self.ctx
    }
}

impl DerefMut for ActivationGuard<'_> {
    fn deref_mut(&mut self) -> &mut ExecutionContext {
        self.ctx
    }
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        let pushed = std::mem::take(&mut self.pushed);
        self.ctx.pop_frames(&pushed);
    }
}
