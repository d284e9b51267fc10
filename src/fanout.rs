//! # Parallel Fan-out
//!
//! Runs `with_each_shard` across isolated workers, one per database server.
//!
//! ```text
//!                 coordinator
//!      (clears connections, admits <= degree workers)
//!            │             │             │
//!       worker db1    worker db2    worker db3     own ExecutionContext,
//!       shards 1,2    shards 3      shards 4,5     forked registry cache
//!            │             │             │
//!            └── stdout/stderr lines ────┘──────▶ prefixed on coordinator streams
//!            └── marshaled failure (bincode) ───▶ first one re-raised
//! ```
//!
//! Workers share no state with the coordinator apart from the collaborators behind
//! [`Sharding`]. Failures cross the boundary only in serialized form. Parallel mode
//! collects errors, not values: the combined result is empty.

use crate::activation::{Category, ExecutionContext};
use crate::config::{ParallelConfig, ShardingConfig, WORKER_PANIC_STATUS};
use crate::error::{MarshaledFailure, ShardError};
use crate::iteration::{EachShardOptions, ErrorPolicy, ShardOutput, ShardScope};
use crate::model::{DatabaseServerId, Shard};
use crate::Sharding;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

pub type WorkerId = u32;

/// Options for one `with_each_shard_parallel` call.
#[derive(Debug, Clone)]
pub struct ParallelOptions {
    /// Applied inside every worker
    pub each: EachShardOptions,
    /// Upper bound on concurrent workers; 1 runs sequentially
    pub degree: usize,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self::new(EachShardOptions::default(), 1)
    }
}

impl ParallelOptions {
    pub fn new(each: EachShardOptions, degree: usize) -> Self {
        Self {
            each,
            degree: degree.max(1),
        }
    }

    pub fn from_config(config: &ShardingConfig) -> Self {
        Self::new(EachShardOptions::from_config(config), config.parallel.degree)
    }

    pub fn categories(mut self, categories: &[Category]) -> Self {
        self.each = self.each.categories(categories);
        self
    }

    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.each = self.each.on_error(policy);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Messages from workers to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// One complete output line, without its terminator
    Line {
        worker: WorkerId,
        stream: Stream,
        text: String,
    },
    /// Sent once, after every line of that worker
    Exited { worker: WorkerId },
}

/// Exit status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus(pub i32);

impl WorkerStatus {
    pub const SUCCESS: WorkerStatus = WorkerStatus(0);
    pub const FAILURE: WorkerStatus = WorkerStatus(1);

    pub fn success(self) -> bool {
        self.0 == 0
    }
}

/// Line-buffered writer that forwards complete lines as [`WorkerEvent::Line`].
///
/// A trailing partial line is sent when the writer is dropped.
pub struct ProxyWriter {
    worker: WorkerId,
    stream: Stream,
    events: Sender<WorkerEvent>,
    buf: Vec<u8>,
}

impl ProxyWriter {
    pub fn new(worker: WorkerId, stream: Stream, events: Sender<WorkerEvent>) -> Self {
        Self {
            worker,
            stream,
            events,
            buf: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) -> io::Result<()> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        self.events
            .send(WorkerEvent::Line {
                worker: self.worker,
                stream: self.stream,
                text: String::from_utf8_lossy(line).into_owned(),
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "coordinator is gone"))
    }
}

impl Write for ProxyWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1])?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ProxyWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let _ = self.emit(&rest);
        }
    }
}

/// Streams and failure pipe handed to a worker job.
pub struct WorkerIo {
    pub stdout: ProxyWriter,
    pub stderr: ProxyWriter,
    /// Receives at most one marshaled failure
    pub failure: Sender<Vec<u8>>,
}

pub type WorkerJob = Box<dyn FnOnce(WorkerIo) -> WorkerStatus + Send + 'static>;

/// A spawned worker, waited on by the coordinator after its `Exited` event.
pub struct WorkerHandle {
    pub id: WorkerId,
    pub name: String,
    failure: Receiver<Vec<u8>>,
    waiter: Box<dyn FnOnce() -> WorkerStatus + Send>,
}

impl WorkerHandle {
    pub fn new(
        id: WorkerId,
        name: impl Into<String>,
        failure: Receiver<Vec<u8>>,
        waiter: Box<dyn FnOnce() -> WorkerStatus + Send>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            failure,
            waiter,
        }
    }

    /// Waits for exit; returns the status and the marshaled failure, if one was sent.
    pub fn wait(self) -> (WorkerStatus, Option<Vec<u8>>) {
        let status = (self.waiter)();
        (status, self.failure.try_recv().ok())
    }
}

/// Starts isolated workers.
///
/// Implementations must deliver [`WorkerEvent::Exited`] for every spawned worker, after
/// all of its output lines, including when the job panics.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        id: WorkerId,
        name: &str,
        events: Sender<WorkerEvent>,
        job: WorkerJob,
    ) -> io::Result<WorkerHandle>;
}

/// Runs each worker on its own named OS thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl ThreadSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        name: &str,
        events: Sender<WorkerEvent>,
        job: WorkerJob,
    ) -> io::Result<WorkerHandle> {
        let (failure_tx, failure_rx) = bounded(1);
        let io = WorkerIo {
            stdout: ProxyWriter::new(id, Stream::Stdout, events.clone()),
            stderr: ProxyWriter::new(id, Stream::Stderr, events.clone()),
            failure: failure_tx,
        };
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let status = panic::catch_unwind(AssertUnwindSafe(|| job(io)))
                .unwrap_or(WorkerStatus(WORKER_PANIC_STATUS));
            let _ = events.send(WorkerEvent::Exited { worker: id });
            status
        })?;
        let waiter = Box::new(move || {
            handle
                .join()
                .unwrap_or(WorkerStatus(WORKER_PANIC_STATUS))
        });
        Ok(WorkerHandle::new(id, name, failure_rx, waiter))
    }
}

/// Tagged payload on the failure pipe.
#[derive(Debug, Serialize, Deserialize)]
enum WorkerMessage {
    Failure(MarshaledFailure),
    /// Neither form could be serialized
    Opaque,
}

/// Serializes a worker failure, falling back to the reduced form when the full form is
/// larger than `max_failure_bytes` or cannot be serialized.
pub fn marshal_failure(worker: &str, err: &anyhow::Error, config: &ParallelConfig) -> Vec<u8> {
    let full = MarshaledFailure::capture(worker, err);
    let reduced = full.reduce(config.trace_head_frames, config.trace_tail_frames);
    match bincode::serialize(&WorkerMessage::Failure(full)) {
        Ok(bytes) if bytes.len() <= config.max_failure_bytes => return bytes,
        Ok(bytes) => {
            debug!(worker, size = bytes.len(), "failure exceeds size ceiling, sending reduced form")
        }
        Err(err) => warn!(worker, error = %err, "failure not serializable, sending reduced form"),
    }
    bincode::serialize(&WorkerMessage::Failure(reduced))
        .or_else(|_| bincode::serialize(&WorkerMessage::Opaque))
        .unwrap_or_default()
}

/// Rebuilds a failure sent by [`marshal_failure`]; `None` for opaque or corrupt payloads.
pub fn unmarshal_failure(bytes: &[u8]) -> Option<MarshaledFailure> {
    match bincode::deserialize::<WorkerMessage>(bytes) {
        Ok(WorkerMessage::Failure(failure)) => Some(failure),
        Ok(WorkerMessage::Opaque) => None,
        Err(err) => {
            warn!(error = %err, "undecodable worker failure");
            None
        }
    }
}

/// Splits shards into per-server groups, keeping first-seen order.
fn group_by_server(shards: Vec<Shard>) -> Vec<(Option<DatabaseServerId>, Vec<Shard>)> {
    let mut groups: Vec<(Option<DatabaseServerId>, Vec<Shard>)> = Vec::new();
    for shard in shards {
        match groups
            .iter_mut()
            .find(|(server, _)| *server == shard.database_server_id)
        {
            Some((_, members)) => members.push(shard),
            None => groups.push((shard.database_server_id.clone(), vec![shard])),
        }
    }
    groups
}

fn worker_name(prefix: &str, server: Option<&DatabaseServerId>) -> String {
    match server {
        Some(server) => format!("{}-{}", prefix, server),
        None => format!("{}-default", prefix),
    }
}

fn worker_job<F, O>(
    sharding: Arc<Sharding>,
    name: String,
    shards: Vec<Shard>,
    options: EachShardOptions,
    f: Arc<F>,
) -> WorkerJob
where
    F: Fn(&mut ExecutionContext, &Shard) -> anyhow::Result<O> + Send + Sync + 'static,
    O: ShardOutput + 'static,
{
    Box::new(move |io: WorkerIo| {
        let WorkerIo {
            stdout,
            stderr,
            failure,
        } = io;
        let parallel = sharding.config().parallel.clone();
        let outcome = {
            let mut ctx = ExecutionContext::with_output(sharding.fork(), Box::new(stdout), Box::new(stderr));
            ctx.run_each_shard(shards, &options, &mut &*f).map(|_| ())
        };
        match outcome {
            Ok(()) => WorkerStatus::SUCCESS,
            Err(err) => {
                if failure.send(marshal_failure(&name, &err, &parallel)).is_err() {
                    warn!(worker = %name, "failure pipe closed");
                }
                WorkerStatus::FAILURE
            }
        }
    })
}

impl ExecutionContext {
    /// `with_each_shard` spread across up to `options.degree` workers, one per server.
    ///
    /// Falls back to the sequential path (and returns its values) when the degree is 1 or
    /// all shards share one server. Otherwise waits for every worker, then re-raises the
    /// first worker failure as [`ShardError::WorkerFailure`], or reports workers that died
    /// without one as [`ShardError::AggregateWorkerError`]. The returned vector is empty
    /// in that case.
    pub fn with_each_shard_parallel<F, O>(
        &mut self,
        scope: impl Into<ShardScope>,
        options: &ParallelOptions,
        f: F,
    ) -> anyhow::Result<Vec<O::Item>>
    where
        F: Fn(&mut ExecutionContext, &Shard) -> anyhow::Result<O> + Send + Sync + 'static,
        O: ShardOutput + 'static,
    {
        let shards = self.resolve_scope(scope.into(), &options.each)?;
        if options.degree <= 1 {
            return self.run_each_shard(shards, &options.each, &mut &f);
        }
        let groups = group_by_server(shards);
        if groups.len() <= 1 {
            debug!("single server group, running sequentially");
            let shards = groups.into_iter().flat_map(|(_, shards)| shards).collect();
            return self.run_each_shard(shards, &options.each, &mut &f);
        }

        self.sharding().connections().clear_all();
        self.coordinate(groups, options, Arc::new(f))?;
        Ok(Vec::new())
    }

    fn coordinate<F, O>(
        &mut self,
        groups: Vec<(Option<DatabaseServerId>, Vec<Shard>)>,
        options: &ParallelOptions,
        f: Arc<F>,
    ) -> Result<(), ShardError>
    where
        F: Fn(&mut ExecutionContext, &Shard) -> anyhow::Result<O> + Send + Sync + 'static,
        O: ShardOutput + 'static,
    {
        let sharding = Arc::clone(self.sharding());
        let spawner = Arc::clone(sharding.spawner());
        let prefix = sharding.config().parallel.worker_prefix.clone();
        let degree = options.degree.max(1);

        let (events_tx, events_rx) = unbounded();
        let mut pending: VecDeque<_> = groups
            .into_iter()
            .map(|(server, shards)| (worker_name(&prefix, server.as_ref()), shards))
            .collect();
        let mut running: HashMap<WorkerId, WorkerHandle> = HashMap::new();
        let mut failures: Vec<MarshaledFailure> = Vec::new();
        let mut unexpected: Vec<String> = Vec::new();
        let mut next_id: WorkerId = 0;

        loop {
            while running.len() < degree {
                let Some((name, shards)) = pending.pop_front() else {
                    break;
                };
                next_id += 1;
                let job = worker_job(
                    Arc::clone(&sharding),
                    name.clone(),
                    shards,
                    options.each.clone(),
                    Arc::clone(&f),
                );
                match spawner.spawn(next_id, &name, events_tx.clone(), job) {
                    Ok(handle) => {
                        info!(worker = %name, id = next_id, "spawned worker");
                        running.insert(next_id, handle);
                    }
                    Err(err) => {
                        warn!(worker = %name, error = %err, "failed to spawn worker");
                        unexpected.push(name);
                    }
                }
            }
            if running.is_empty() {
                break;
            }

            // The coordinator holds a sender, so this only fails if a spawner broke the
            // Exited contract and dropped every clone.
            let Ok(event) = events_rx.recv() else {
                unexpected.extend(running.drain().map(|(_, handle)| handle.name));
                break;
            };
            match event {
                WorkerEvent::Line {
                    worker,
                    stream,
                    text,
                } => {
                    let name = running.get(&worker).map_or("?", |h| h.name.as_str());
                    let line = format!("{}: {}", name, text);
                    let written = match stream {
                        Stream::Stdout => writeln!(self.out(), "{}", line),
                        Stream::Stderr => writeln!(self.err(), "{}", line),
                    };
                    if let Err(err) = written {
                        warn!(error = %err, "failed to proxy worker output");
                    }
                }
                WorkerEvent::Exited { worker } => {
                    let Some(handle) = running.remove(&worker) else {
                        continue;
                    };
                    let name = handle.name.clone();
                    let (status, payload) = handle.wait();
                    debug!(worker = %name, status = status.0, "worker exited");
                    match payload.as_deref().and_then(unmarshal_failure) {
                        Some(failure) => failures.push(failure),
                        None if !status.success() => {
                            warn!(worker = %name, status = status.0, "worker failed without a report");
                            unexpected.push(name);
                        }
                        None => {}
                    }
                }
            }
        }

        if let Some(first) = failures.into_iter().next() {
            return Err(ShardError::WorkerFailure(Box::new(first)));
        }
        if !unexpected.is_empty() {
            return Err(ShardError::AggregateWorkerError {
                workers: unexpected,
            });
        }
        Ok(())
    }
}
