//! Generator and simulator callables and the context they run in.
//!
//! Callables run on dedicated worker threads, each driving its own
//! single-threaded tokio runtime, so they may block or `.await` freely.
//! Returning `Err` from a callable is a callable exception: the run aborts
//! or the affected points are marked failed, depending on configuration.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use prometheus_ensemble::core::{CallInput, SimOutput, Simulator, WorkerContext};
//!
//! struct Square;
//!
//! #[async_trait]
//! impl Simulator for Square {
//!     async fn evaluate(&self, input: CallInput, ctx: &mut WorkerContext) -> anyhow::Result<SimOutput> {
//!         let rows = input.rows.iter().map(|row| square(row)).collect();
//!         Ok(SimOutput::success(rows))
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::history::{HistoryId, NewPoint};
use crate::core::resource_pool::ResourcePool;
use crate::core::schema::Row;
use crate::core::work::CalcStatus;
use crate::core::worker::WorkerId;

/// Cancellation signal shared between the manager and one worker.
///
/// The manager raises it when a point the worker is evaluating gets
/// `cancel_requested`; it is lowered when new sim work is dispatched.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the current evaluation to stop.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Lower the flag.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a callable sees besides its input rows.
#[derive(Debug)]
pub struct WorkerContext {
    worker_id: WorkerId,
    persis_info: serde_json::Value,
    resources: Option<Arc<ResourcePool>>,
    cancel: CancelFlag,
}

impl WorkerContext {
    /// Build a context. `resources` is the worker's share of the run's
    /// resource units, if the assignment reserved any.
    #[must_use]
    pub const fn new(
        worker_id: WorkerId,
        persis_info: serde_json::Value,
        resources: Option<Arc<ResourcePool>>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            worker_id,
            persis_info,
            resources,
            cancel,
        }
    }

    /// Worker this callable runs on.
    #[must_use]
    pub const fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Whether the manager asked to abandon the current evaluation.
    /// Simulators should check it between expensive steps and reply with
    /// [`SimOutput::cancelled`].
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_raised()
    }

    /// Per-worker persistent state; changes are sent back to the manager.
    pub fn persis_info(&mut self) -> &mut serde_json::Value {
        &mut self.persis_info
    }

    /// Scoped resource pool sized to this assignment's reservation, for
    /// use with a [`TaskExecutor`](crate::core::TaskExecutor).
    #[must_use]
    pub fn resources(&self) -> Option<Arc<ResourcePool>> {
        self.resources.clone()
    }

    pub(crate) fn into_persis_info(self) -> serde_json::Value {
        self.persis_info
    }
}

/// Rows handed to a callable, aligned with their history ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallInput {
    /// History ids, ascending.
    pub history_ids: Vec<HistoryId>,
    /// One row per id with the configured input fields.
    pub rows: Vec<Row>,
}

impl CallInput {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Simulator reply.
#[derive(Debug, Clone, PartialEq)]
pub struct SimOutput {
    /// One sim-output row per input row, same order. Ignored unless
    /// `status` is [`CalcStatus::Success`].
    pub rows: Vec<Row>,
    /// Outcome.
    pub status: CalcStatus,
}

impl SimOutput {
    /// Normal completion.
    #[must_use]
    pub const fn success(rows: Vec<Row>) -> Self {
        Self {
            rows,
            status: CalcStatus::Success,
        }
    }

    /// Evaluation abandoned after a cancel request.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self {
            rows: Vec::new(),
            status: CalcStatus::Cancelled,
        }
    }

    /// Evaluation failed without raising (e.g. a task timed out).
    #[must_use]
    pub const fn failed() -> Self {
        Self {
            rows: Vec::new(),
            status: CalcStatus::Failed,
        }
    }
}

/// Generator reply for one round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenOutput {
    /// New points.
    pub points: Vec<NewPoint>,
    /// Earlier points that are no longer needed.
    pub cancel_ids: Vec<HistoryId>,
    /// End the session after this output.
    pub finished: bool,
}

impl GenOutput {
    /// Output carrying `points`.
    #[must_use]
    pub fn points(points: Vec<NewPoint>) -> Self {
        Self {
            points,
            ..Self::default()
        }
    }

    /// Also cancel `ids`.
    #[must_use]
    pub fn cancelling(mut self, ids: Vec<HistoryId>) -> Self {
        self.cancel_ids = ids;
        self
    }

    /// Mark the session finished.
    #[must_use]
    pub const fn finish(mut self) -> Self {
        self.finished = true;
        self
    }
}

/// Evaluates points. One instance is shared by all workers.
#[async_trait]
pub trait Simulator: Send + Sync + 'static {
    /// Evaluate a dispatched sub-batch.
    async fn evaluate(&self, input: CallInput, ctx: &mut WorkerContext) -> anyhow::Result<SimOutput>;
}

/// A persistent generator session, alive on one worker across many rounds.
#[async_trait]
pub trait Generator: Send {
    /// First round: produce the initial points.
    async fn start(&mut self, ctx: &mut WorkerContext) -> anyhow::Result<GenOutput>;

    /// Later rounds: `returned` holds the completed group in id order.
    async fn resume(&mut self, returned: CallInput, ctx: &mut WorkerContext) -> anyhow::Result<GenOutput>;

    /// The run is ending; any points returned are recorded but not evaluated.
    async fn finish(&mut self, _ctx: &mut WorkerContext) -> anyhow::Result<Vec<NewPoint>> {
        Ok(Vec::new())
    }
}

/// Creates a generator session whenever a worker starts one.
pub trait GeneratorFactory: Send + Sync + 'static {
    /// New session for `worker_id`.
    fn create(&self, worker_id: WorkerId) -> Box<dyn Generator>;
}

impl<F, G> GeneratorFactory for F
where
    F: Fn(WorkerId) -> G + Send + Sync + 'static,
    G: Generator + 'static,
{
    fn create(&self, worker_id: WorkerId) -> Box<dyn Generator> {
        Box::new(self(worker_id))
    }
}
