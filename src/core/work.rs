//! Messages exchanged between the manager and workers.

use serde::{Deserialize, Serialize};

use crate::core::history::{HistoryId, NewPoint};
use crate::core::resource_pool::ReservationHandle;
use crate::core::schema::Row;
use crate::core::worker::WorkerId;

/// Which callable a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Generator: produces points.
    Gen,
    /// Simulator: evaluates points.
    Sim,
}

/// Outcome reported by a callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcStatus {
    /// Normal completion.
    Success,
    /// The callable failed.
    Failed,
    /// The evaluation was abandoned after a cancel request.
    Cancelled,
}

/// Start of a persistent generator session or a continuation of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenPhase {
    /// First call; the session begins.
    Start,
    /// Returned results of a completed group are fed back.
    Continue,
}

/// Evaluate a group of points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimWork {
    /// Target worker.
    pub worker_id: WorkerId,
    /// Points to evaluate, ascending.
    pub history_ids: Vec<HistoryId>,
    /// Fields shipped with each point.
    pub input_fields: Vec<String>,
    /// Units held for the duration of the evaluation.
    pub reservation: Option<ReservationHandle>,
}

/// Start or continue a persistent generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenWork {
    /// Target worker.
    pub worker_id: WorkerId,
    /// Start or continuation.
    pub phase: GenPhase,
    /// Completed group fed back on continuation, ascending; empty on start.
    pub history_ids: Vec<HistoryId>,
    /// Fields shipped with each returned point.
    pub input_fields: Vec<String>,
    /// Units held for the whole session; set on start only.
    pub reservation: Option<ReservationHandle>,
}

/// A unit of work for one worker in one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkAssignment {
    /// Simulator dispatch.
    Sim(SimWork),
    /// Generator session start or continuation.
    Gen(GenWork),
}

impl WorkAssignment {
    /// Target worker.
    #[must_use]
    pub const fn worker_id(&self) -> WorkerId {
        match self {
            Self::Sim(w) => w.worker_id,
            Self::Gen(w) => w.worker_id,
        }
    }

    /// Callable role.
    #[must_use]
    pub const fn role(&self) -> Role {
        match self {
            Self::Sim(_) => Role::Sim,
            Self::Gen(_) => Role::Gen,
        }
    }

    /// History ids carried by the assignment.
    #[must_use]
    pub fn history_ids(&self) -> &[HistoryId] {
        match self {
            Self::Sim(w) => &w.history_ids,
            Self::Gen(w) => &w.history_ids,
        }
    }

    /// Fields shipped with each row.
    #[must_use]
    pub fn input_fields(&self) -> &[String] {
        match self {
            Self::Sim(w) => &w.input_fields,
            Self::Gen(w) => &w.input_fields,
        }
    }

    /// Whether this starts a persistent session.
    #[must_use]
    pub const fn is_persistent_start(&self) -> bool {
        matches!(self, Self::Gen(GenWork { phase: GenPhase::Start, .. }))
    }

    /// Whether this continues a persistent session.
    #[must_use]
    pub const fn is_persistent_continuation(&self) -> bool {
        matches!(self, Self::Gen(GenWork { phase: GenPhase::Continue, .. }))
    }

    /// Reservation taken for this assignment.
    #[must_use]
    pub const fn reservation(&self) -> Option<ReservationHandle> {
        match self {
            Self::Sim(w) => w.reservation,
            Self::Gen(w) => w.reservation,
        }
    }
}

/// Payload of a worker's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkOutput {
    /// One sim-output row per evaluated id, in the order received.
    Sim {
        /// Output rows.
        rows: Vec<Row>,
    },
    /// Generator output.
    Gen {
        /// New points to append to the history.
        points: Vec<NewPoint>,
        /// Earlier points this generator no longer needs.
        cancel_ids: Vec<HistoryId>,
        /// The session ended voluntarily.
        finished: bool,
    },
}

/// Reply from a worker (the result message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    /// Replying worker.
    pub worker_id: WorkerId,
    /// History ids the reply refers to (the dispatched ids for sims).
    pub history_ids: Vec<HistoryId>,
    /// Output payload.
    pub output: WorkOutput,
    /// Reported outcome.
    pub status: CalcStatus,
    /// Updated persistent info for the worker.
    pub persis_info: serde_json::Value,
    /// Error text when `status` is [`CalcStatus::Failed`].
    pub error: Option<String>,
}

impl WorkResult {
    /// Role that produced this reply.
    #[must_use]
    pub const fn role(&self) -> Role {
        match self.output {
            WorkOutput::Sim { .. } => Role::Sim,
            WorkOutput::Gen { .. } => Role::Gen,
        }
    }
}
