//! Error types for scheduler operations.
//!
//! Resource scarcity is deliberately absent from [`SchedulerError`]: the
//! resource pool reports it through [`ReserveOutcome`](super::ReserveOutcome)
//! and the allocation engine defers the worker instead of failing.

use thiserror::Error;

use crate::core::history::HistoryId;
use crate::core::resource_pool::ReservationHandle;
use crate::core::worker::WorkerId;

/// Fatal, run-aborting errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Rows returned by a callable do not match the declared schema.
    #[error("schema mismatch in {context}: {detail}")]
    SchemaMismatch {
        /// Where the mismatch was detected (e.g. `sim output of worker 3`).
        context: String,
        /// What was wrong with the rows.
        detail: String,
    },
    /// A reservation was released twice or never existed.
    #[error("release of unknown or already released reservation {handle}")]
    UnknownReservation {
        /// The offending handle.
        handle: ReservationHandle,
    },
    /// A generator or simulator callable returned an error.
    #[error("callable failed on worker {worker_id} (history ids {}): {message}", format_ids(.history_ids))]
    CallableException {
        /// Worker the callable ran on.
        worker_id: WorkerId,
        /// History ids the worker was evaluating, if any.
        history_ids: Vec<HistoryId>,
        /// Error reported by the callable.
        message: String,
    },
    /// A history or worker-state invariant would be broken.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// No assignment is possible, nothing is in flight, and the last tick
    /// deferred a worker for lack of free units.
    #[error(
        "resource exhaustion stall: {pending_points} pending points, {free_units}/{total_units} units free"
    )]
    ResourceStall {
        /// Units currently free.
        free_units: u32,
        /// Pool capacity.
        total_units: u32,
        /// Points waiting to be dispatched.
        pending_points: usize,
    },
    /// Invalid run configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Worker thread or channel failure.
    #[error("worker runtime error: {0}")]
    Worker(String),
}

/// Errors surfaced by the task executor to the simulator that called it.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The executor's pool cannot cover the request right now.
    #[error("insufficient resources: requested {requested}, free {free}")]
    InsufficientResources {
        /// Units requested by the submission.
        requested: u32,
        /// Units free at submission time.
        free: u32,
    },
    /// The process could not be launched.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The handle does not belong to this executor.
    #[error("unknown task {0}")]
    UnknownTask(u64),
    /// Resource accounting failed while finishing a task.
    #[error(transparent)]
    Resource(#[from] SchedulerError),
    /// I/O failure while supervising a process.
    #[error("task i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

fn format_ids(ids: &[HistoryId]) -> String {
    match (ids.first(), ids.last()) {
        (Some(first), Some(last)) if first == last => first.to_string(),
        (Some(first), Some(last)) => format!("{first}..={last}"),
        _ => "none".to_string(),
    }
}
