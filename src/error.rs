//! # Error Model
//!
//! Typed failures raised by the id codec, the registry and the fan-out coordinator.
//! Per-shard blocks supplied by callers return `anyhow::Result`; these variants travel
//! inside `anyhow::Error` and can be recovered with `downcast_ref::<ShardError>()`.

use crate::model::ShardId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for registry, store and codec operations.
pub type ShardResult<T> = Result<T, ShardError>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ShardError {
    /// Input matched none of the recognized id shapes.
    #[error("unparseable id: {input:?}")]
    Unparseable { input: String },

    /// Zero, negative or out-of-range shard id.
    #[error("invalid shard id: {0}")]
    InvalidShardId(i64),

    /// A second shard flagged as default.
    #[error("shard {existing} is already the default shard")]
    DuplicateDefault { existing: ShardId },

    #[error("the default shard {0} cannot be destroyed")]
    DestroyDefault(ShardId),

    #[error("shard {0} already exists")]
    ShardExists(ShardId),

    /// Hard-failing lookup of a shard that cannot be resolved.
    #[error("unknown shard: {0}")]
    UnknownShard(ShardId),

    #[error("database server {0:?} is not configured")]
    UnknownServer(String),

    /// The backing shard store could not be reached.
    #[error("shard store unavailable: {0}")]
    StoreUnavailable(String),

    /// A parallel worker failed; rebuilt on the coordinator from its marshaled form.
    #[error("{0}")]
    WorkerFailure(Box<MarshaledFailure>),

    /// Workers exited unsuccessfully without reporting a failure.
    #[error("the following workers failed unexpectedly: {}", workers.join(", "))]
    AggregateWorkerError { workers: Vec<String> },
}

impl ShardError {
    pub fn unparseable(input: impl Into<String>) -> Self {
        Self::Unparseable {
            input: input.into(),
        }
    }

    /// Whether this error signals a broken data-model invariant.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidShardId(_)
                | Self::DuplicateDefault { .. }
                | Self::DestroyDefault(_)
                | Self::ShardExists(_)
        )
    }
}

/// A failure captured inside a worker and shipped back to the coordinator.
///
/// The full form carries the whole error chain, the captured backtrace and, when the
/// failure was a [`ShardError`], the typed original. The reduced form keeps only the
/// message and a trimmed backtrace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarshaledFailure {
    /// Name of the worker that raised the failure
    pub worker: String,
    /// Top-level error message
    pub message: String,
    /// Messages of every error in the source chain, outermost first
    pub chain: Vec<String>,
    /// Backtrace frames, empty when none was captured
    pub backtrace: Vec<String>,
    /// Typed original, when the failure was a `ShardError`
    pub original: Option<ShardError>,
    /// True when this is the reduced form
    pub reduced: bool,
}

impl MarshaledFailure {
    /// Capture the full form of `err`.
    pub fn capture(worker: &str, err: &anyhow::Error) -> Self {
        let backtrace = match err.backtrace().status() {
            std::backtrace::BacktraceStatus::Captured => err
                .backtrace()
                .to_string()
                .lines()
                .map(|line| line.trim_end().to_string())
                .collect(),
            _ => Vec::new(),
        };
        Self {
            worker: worker.to_string(),
            message: err.to_string(),
            chain: err.chain().map(|cause| cause.to_string()).collect(),
            backtrace,
            original: err.downcast_ref::<ShardError>().cloned(),
            reduced: false,
        }
    }

    /// Reduced form: message plus at most `head + tail` backtrace frames.
    pub fn reduce(&self, head: usize, tail: usize) -> Self {
        let frames = &self.backtrace;
        let backtrace = if frames.len() <= head + tail {
            frames.clone()
        } else {
            frames[..head]
                .iter()
                .chain(frames[frames.len() - tail..].iter())
                .cloned()
                .collect()
        };
        Self {
            worker: self.worker.clone(),
            message: self.message.clone(),
            chain: Vec::new(),
            backtrace,
            original: None,
            reduced: true,
        }
    }
}

impl std::fmt::Display for MarshaledFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker {} failed: {}", self.worker, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_violations_are_classified() {
        assert!(ShardError::InvalidShardId(0).is_invariant_violation());
        assert!(ShardError::DestroyDefault(ShardId::new(1).unwrap()).is_invariant_violation());
        assert!(!ShardError::unparseable("abc").is_invariant_violation());
        assert!(!ShardError::UnknownShard(ShardId::new(3).unwrap()).is_invariant_violation());
    }

    #[test]
    fn capture_keeps_typed_original_and_chain() {
        let err = anyhow::Error::new(ShardError::unparseable("1~x")).context("loading account");
        let failure = MarshaledFailure::capture("shard-db1", &err);
        assert_eq!(failure.message, "loading account");
        assert_eq!(failure.chain.len(), 2);
        assert_eq!(failure.original, Some(ShardError::unparseable("1~x")));
        assert!(!failure.reduced);
    }

    #[test]
    fn reduce_trims_backtrace_from_both_ends() {
        let failure = MarshaledFailure {
            worker: "w".to_string(),
            message: "boom".to_string(),
            chain: vec!["boom".to_string()],
            backtrace: (0..100).map(|i| format!("frame {i}")).collect(),
            original: Some(ShardError::InvalidShardId(0)),
            reduced: false,
        };
        let reduced = failure.reduce(25, 25);
        assert_eq!(reduced.backtrace.len(), 50);
        assert_eq!(reduced.backtrace[0], "frame 0");
        assert_eq!(reduced.backtrace[24], "frame 24");
        assert_eq!(reduced.backtrace[25], "frame 75");
        assert_eq!(reduced.backtrace[49], "frame 99");
        assert!(reduced.chain.is_empty());
        assert!(reduced.original.is_none());
        assert!(reduced.reduced);
    }

    #[test]
    fn aggregate_error_names_every_worker() {
        let err = ShardError::AggregateWorkerError {
            workers: vec!["shard-a".to_string(), "shard-b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "the following workers failed unexpectedly: shard-a, shard-b"
        );
    }
}
