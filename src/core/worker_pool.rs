//! Worker runtime: one dedicated OS thread per worker.
//!
//! Each worker thread owns a single-threaded tokio runtime and runs one
//! command at a time. The manager talks to workers over crossbeam channels:
//! a bounded command channel per worker and one shared result channel.
//! Workers never touch the history or the run's resource pool; they only
//! send [`WorkResult`] messages back.
//!
//! A persistent generator session lives on its worker thread between
//! rounds, so the generator object keeps its own state without the manager
//! holding it.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::core::callable::{CallInput, CancelFlag, GenOutput, Generator, GeneratorFactory, Simulator, WorkerContext};
use crate::core::history::HistoryId;
use crate::core::resource_pool::ReservationHandle;
use crate::core::schema::Row;
use crate::core::work::{CalcStatus, GenPhase, WorkAssignment, WorkOutput, WorkResult};
use crate::core::worker::WorkerId;
use crate::core::SchedulerError;

/// Commands a worker accepts; at most a couple are ever queued.
const COMMAND_QUEUE_DEPTH: usize = 4;

/// How long shutdown waits for each worker thread before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// An assignment with everything the worker needs to run it.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// The assignment.
    pub assignment: WorkAssignment,
    /// Input rows, aligned with the assignment's history ids.
    pub rows: Vec<Row>,
    /// The worker's persistent info.
    pub persis_info: serde_json::Value,
}

#[derive(Debug)]
enum Command {
    Run(Box<Dispatch>),
    StopGen { persis_info: serde_json::Value },
}

struct WorkerHandle {
    id: WorkerId,
    tx: Option<Sender<Command>>,
    cancel: CancelFlag,
    join: Option<JoinHandle<()>>,
}

/// Pool of worker threads for one run.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    results: Receiver<WorkResult>,
    shutdown: AtomicBool,
}

impl WorkerPool {
    /// Spawn `count` workers numbered `1..=count`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Worker`] if a thread cannot be spawned; the
    /// threads already started are shut down.
    pub fn spawn(
        count: usize,
        simulator: Arc<dyn Simulator>,
        generators: Arc<dyn GeneratorFactory>,
        stack_size: usize,
    ) -> Result<Self, SchedulerError> {
        let (result_tx, results) = unbounded();
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            results,
            shutdown: AtomicBool::new(false),
        };

        for id in 1..=count {
            let (tx, rx) = bounded(COMMAND_QUEUE_DEPTH);
            let cancel = CancelFlag::new();
            let worker = WorkerThread {
                id,
                commands: rx,
                results: result_tx.clone(),
                cancel: cancel.clone(),
                simulator: Arc::clone(&simulator),
                generators: Arc::clone(&generators),
                session: None,
            };
            let join = thread::Builder::new()
                .name(format!("ens-worker-{id}"))
                .stack_size(stack_size)
                .spawn(move || worker.run());
            match join {
                Ok(join) => pool.workers.push(WorkerHandle {
                    id,
                    tx: Some(tx),
                    cancel,
                    join: Some(join),
                }),
                Err(err) => {
                    pool.shutdown();
                    return Err(SchedulerError::Worker(format!("failed to spawn worker {id}: {err}")));
                }
            }
        }

        info!(worker_count = count, "worker threads started");
        Ok(pool)
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Send an assignment to its worker. Sim work lowers the worker's cancel
    /// flag first, so a cancel raised after this call always reaches the
    /// evaluation it targets.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Worker`] if the worker is unknown or gone.
    pub fn send(&self, dispatch: Dispatch) -> Result<(), SchedulerError> {
        let id = dispatch.assignment.worker_id();
        if let (WorkAssignment::Sim(_), Some(worker)) = (&dispatch.assignment, self.handle(id)) {
            worker.cancel.clear();
        }
        self.command(id, Command::Run(Box::new(dispatch)))
    }

    /// Ask the generator session on `id` for its final output.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Worker`] if the worker is unknown or gone.
    pub fn stop_gen(&self, id: WorkerId, persis_info: serde_json::Value) -> Result<(), SchedulerError> {
        self.command(id, Command::StopGen { persis_info })
    }

    /// Raise the cancel flag of worker `id`.
    pub fn cancel(&self, id: WorkerId) {
        if let Some(worker) = self.handle(id) {
            debug!(worker_id = id, "raising cancel flag");
            worker.cancel.raise();
        }
    }

    /// Raise every worker's cancel flag.
    pub fn cancel_all(&self) {
        for worker in &self.workers {
            worker.cancel.raise();
        }
    }

    /// Wait up to `timeout` for the next worker message.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Worker`] when every worker thread has exited.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkResult>, SchedulerError> {
        match self.results.recv_timeout(timeout) {
            Ok(result) => Ok(Some(result)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(SchedulerError::Worker("all worker threads have exited".into()))
            }
        }
    }

    /// Next worker message if one is already queued.
    #[must_use]
    pub fn try_recv(&self) -> Option<WorkResult> {
        self.results.try_recv().ok()
    }

    /// Close every command channel and join the threads, detaching any that
    /// does not exit in time.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down worker threads");
        for worker in &mut self.workers {
            worker.tx = None;
        }

        for worker in &mut self.workers {
            let Some(join) = worker.join.take() else {
                continue;
            };
            let id = worker.id;
            let (tx, rx) = std::sync::mpsc::channel();
            let joiner = thread::spawn(move || {
                let _ = tx.send(join.join().is_ok());
            });
            match rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(true) => debug!(worker_id = id, "worker joined"),
                Ok(false) => warn!(worker_id = id, "worker thread panicked"),
                Err(_) => warn!(worker_id = id, "worker did not exit within timeout, detaching"),
            }
            drop(joiner);
        }
        info!(worker_count = self.workers.len(), "worker threads shut down");
    }

    fn handle(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.iter().find(|w| w.id == id)
    }

    fn command(&self, id: WorkerId, command: Command) -> Result<(), SchedulerError> {
        let tx = self
            .handle(id)
            .and_then(|w| w.tx.as_ref())
            .ok_or_else(|| SchedulerError::Worker(format!("worker {id} is not running")))?;
        tx.send(command)
            .map_err(|_| SchedulerError::Worker(format!("worker {id} hung up")))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Close channels without joining; explicit shutdown() joins.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            for worker in &mut self.workers {
                worker.tx = None;
                worker.cancel.raise();
            }
            debug!("worker pool dropped without explicit shutdown, threads detached");
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct WorkerThread {
    id: WorkerId,
    commands: Receiver<Command>,
    results: Sender<WorkResult>,
    cancel: CancelFlag,
    simulator: Arc<dyn Simulator>,
    generators: Arc<dyn GeneratorFactory>,
    session: Option<GenSession>,
}

struct GenSession {
    generator: Box<dyn Generator>,
    reservation: Option<ReservationHandle>,
}

impl WorkerThread {
    fn run(mut self) {
        debug!(worker_id = self.id, "worker thread started");
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(err) => {
                error!(worker_id = self.id, error = %err, "failed to create worker runtime");
                return;
            }
        };

        while let Ok(command) = self.commands.recv() {
            let result = match command {
                Command::Run(dispatch) => self.execute(&rt, *dispatch),
                Command::StopGen { persis_info } => self.stop_gen(&rt, persis_info),
            };
            if self.results.send(result).is_err() {
                debug!(worker_id = self.id, "manager hung up");
                break;
            }
        }
        debug!(worker_id = self.id, "worker thread exiting");
    }

    fn execute(&mut self, rt: &tokio::runtime::Runtime, dispatch: Dispatch) -> WorkResult {
        let Dispatch {
            assignment,
            rows,
            persis_info,
        } = dispatch;
        let history_ids = assignment.history_ids().to_vec();
        let input = CallInput {
            history_ids: history_ids.clone(),
            rows,
        };

        match assignment {
            WorkAssignment::Sim(work) => {
                let mut ctx = self.context(persis_info, work.reservation);
                debug!(worker_id = self.id, sim_ids = ?history_ids, "evaluating");
                let simulator = Arc::clone(&self.simulator);
                let outcome = guarded(rt, simulator.evaluate(input, &mut ctx));
                match outcome {
                    Ok(out) => WorkResult {
                        worker_id: self.id,
                        history_ids,
                        output: WorkOutput::Sim { rows: out.rows },
                        status: out.status,
                        persis_info: ctx.into_persis_info(),
                        error: None,
                    },
                    Err(message) => self.sim_failure(history_ids, ctx.into_persis_info(), message),
                }
            }
            WorkAssignment::Gen(work) => {
                if work.phase == GenPhase::Start {
                    if self.session.is_some() {
                        warn!(worker_id = self.id, "replacing an unfinished generator session");
                    }
                    self.session = Some(GenSession {
                        generator: self.generators.create(self.id),
                        reservation: work.reservation,
                    });
                }
                let Some(session) = self.session.as_mut() else {
                    return gen_failure(self.id, history_ids, persis_info, "no generator session to continue".into());
                };
                let mut ctx = WorkerContext::new(
                    self.id,
                    persis_info,
                    session.reservation.map(|h| Arc::new(h.scoped_pool())),
                    self.cancel.clone(),
                );
                let outcome = match work.phase {
                    GenPhase::Start => guarded(rt, session.generator.start(&mut ctx)),
                    GenPhase::Continue => guarded(rt, session.generator.resume(input, &mut ctx)),
                };
                let result = match outcome {
                    Ok(out) => gen_result(self.id, history_ids, out, ctx.into_persis_info()),
                    Err(message) => gen_failure(self.id, history_ids, ctx.into_persis_info(), message),
                };
                if result.status == CalcStatus::Failed || matches!(result.output, WorkOutput::Gen { finished: true, .. }) {
                    self.session = None;
                }
                result
            }
        }
    }

    fn stop_gen(&mut self, rt: &tokio::runtime::Runtime, persis_info: serde_json::Value) -> WorkResult {
        let Some(mut session) = self.session.take() else {
            return gen_result(self.id, Vec::new(), GenOutput::default().finish(), persis_info);
        };
        let mut ctx = WorkerContext::new(
            self.id,
            persis_info,
            session.reservation.map(|h| Arc::new(h.scoped_pool())),
            self.cancel.clone(),
        );
        match guarded(rt, session.generator.finish(&mut ctx)) {
            Ok(points) => gen_result(self.id, Vec::new(), GenOutput::points(points).finish(), ctx.into_persis_info()),
            Err(message) => gen_failure(self.id, Vec::new(), ctx.into_persis_info(), message),
        }
    }

    fn context(&self, persis_info: serde_json::Value, reservation: Option<ReservationHandle>) -> WorkerContext {
        WorkerContext::new(
            self.id,
            persis_info,
            reservation.map(|h| Arc::new(h.scoped_pool())),
            self.cancel.clone(),
        )
    }

    fn sim_failure(&self, history_ids: Vec<HistoryId>, persis_info: serde_json::Value, message: String) -> WorkResult {
        warn!(worker_id = self.id, sim_ids = ?history_ids, error = %message, "simulator failed");
        WorkResult {
            worker_id: self.id,
            history_ids,
            output: WorkOutput::Sim { rows: Vec::new() },
            status: CalcStatus::Failed,
            persis_info,
            error: Some(message),
        }
    }
}

fn gen_result(id: WorkerId, history_ids: Vec<HistoryId>, out: GenOutput, persis_info: serde_json::Value) -> WorkResult {
    WorkResult {
        worker_id: id,
        history_ids,
        output: WorkOutput::Gen {
            points: out.points,
            cancel_ids: out.cancel_ids,
            finished: out.finished,
        },
        status: CalcStatus::Success,
        persis_info,
        error: None,
    }
}

fn gen_failure(id: WorkerId, history_ids: Vec<HistoryId>, persis_info: serde_json::Value, message: String) -> WorkResult {
    warn!(worker_id = id, error = %message, "generator failed");
    WorkResult {
        worker_id: id,
        history_ids,
        output: WorkOutput::Gen {
            points: Vec::new(),
            cancel_ids: Vec::new(),
            finished: true,
        },
        status: CalcStatus::Failed,
        persis_info,
        error: Some(message),
    }
}

/// Run a callable future to completion, turning errors and panics into a
/// message.
fn guarded<T, F>(rt: &tokio::runtime::Runtime, fut: F) -> Result<T, String>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(|| rt.block_on(fut))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .map_or_else(|| "callable panicked".to_string(), |msg| format!("callable panicked: {msg}"))),
    }
}
