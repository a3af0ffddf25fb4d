//! The manager: drives allocation ticks, talks to workers and merges their
//! results into the history.
//!
//! The manager is the only writer of the history and of the run's resource
//! pool. Each loop iteration checks the exit criteria, runs one allocation
//! tick, commits and sends its assignments, then waits briefly for worker
//! messages and merges whatever arrived.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::core::alloc::{cancel_points, Allocator};
use crate::core::audit::{build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink};
use crate::core::callable::{GeneratorFactory, Simulator};
use crate::core::history::{History, HistoryId, NewPoint};
use crate::core::resource_pool::{ReservationHandle, ResourcePool, ResourceSnapshot};
use crate::core::schema::Row;
use crate::core::work::{CalcStatus, GenPhase, WorkAssignment, WorkOutput, WorkResult};
use crate::core::worker::{WorkerId, WorkerRegistry, WorkerState};
use crate::core::worker_pool::{Dispatch, WorkerPool};
use crate::core::SchedulerError;
use crate::util::clock::now_secs;

/// Why a run ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// `sim_max` points have returned.
    SimMaxReached,
    /// The history reached `gen_max` points.
    GenMaxReached,
    /// `wallclock_max_secs` elapsed.
    WallclockReached,
    /// Every generator finished and all their points were resolved.
    GeneratorsFinished,
}

/// A completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Final history.
    pub history: History,
    /// Final persistent info per worker.
    pub persis_info: BTreeMap<WorkerId, serde_json::Value>,
    /// Exit criterion that ended the run.
    pub exit: ExitReason,
    /// Resource pool after draining, before leftover reservations are
    /// reclaimed. Any holder listed here leaked its units.
    pub resources: ResourceSnapshot,
    /// Recorded audit events; empty unless an audit sink was attached.
    pub audit_events: Vec<AuditEvent>,
}

/// A run halted by a fatal error. The partial history stays inspectable.
#[derive(Debug, Error)]
#[error("run aborted: {cause}")]
pub struct RunError {
    /// Originating error.
    #[source]
    pub cause: SchedulerError,
    /// History at the time of the abort.
    pub history: Box<History>,
    /// Recorded audit events.
    pub audit_events: Vec<AuditEvent>,
}

/// Drives one run. Build it with [`ManagerBuilder`](crate::builders::ManagerBuilder).
pub struct Manager {
    pub(crate) config: RunConfig,
    pub(crate) history: History,
    pub(crate) simulator: Arc<dyn Simulator>,
    pub(crate) generators: Arc<dyn GeneratorFactory>,
    pub(crate) allocator: Box<dyn Allocator>,
    pub(crate) persis_info: BTreeMap<WorkerId, serde_json::Value>,
    pub(crate) audit: Option<InMemoryAuditSink>,
}

impl Manager {
    /// Run to completion on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns a [`RunError`] carrying the fatal cause and the partial
    /// history. In-flight work is cancelled and the workers are shut down
    /// before it is returned.
    pub fn run(self) -> Result<RunOutcome, RunError> {
        let Self {
            config,
            history,
            simulator,
            generators,
            allocator,
            persis_info,
            audit,
        } = self;

        let pool = match WorkerPool::spawn(config.nworkers, simulator, generators, config.worker_stack_size) {
            Ok(pool) => pool,
            Err(cause) => {
                return Err(RunError {
                    cause,
                    history: Box::new(history),
                    audit_events: audit.map(|a| a.events()).unwrap_or_default(),
                });
            }
        };

        info!(
            nworkers = config.nworkers,
            total_units = config.resources.total_units,
            max_persistent_gens = config.alloc.max_persistent_gens,
            "run started"
        );
        let mut run = Run {
            resources: ResourcePool::new(config.resources.total_units),
            workers: WorkerRegistry::new(config.nworkers),
            config,
            history,
            allocator,
            pool,
            persis_info,
            audit,
            started: Instant::now(),
            idle_ticks: 0,
            stopping: false,
        };

        match run.main_loop() {
            Ok(exit) => match run.drain() {
                Ok(()) => {
                    let resources = run.resources.snapshot();
                    run.finish();
                    info!(?exit, points = run.history.len(), returned = run.history.returned_count(), "run finished");
                    Ok(RunOutcome {
                        history: run.history,
                        persis_info: run.persis_info,
                        exit,
                        resources,
                        audit_events: run.audit.map(|a| a.events()).unwrap_or_default(),
                    })
                }
                Err(cause) => Err(run.abort(cause)),
            },
            Err(cause) => Err(run.abort(cause)),
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("history_len", &self.history.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct TickSummary {
    assigned: usize,
    deferred: usize,
}

struct Run {
    config: RunConfig,
    history: History,
    resources: ResourcePool,
    workers: WorkerRegistry,
    allocator: Box<dyn Allocator>,
    pool: WorkerPool,
    persis_info: BTreeMap<WorkerId, serde_json::Value>,
    audit: Option<InMemoryAuditSink>,
    started: Instant,
    idle_ticks: u32,
    stopping: bool,
}

impl Run {
    fn main_loop(&mut self) -> Result<ExitReason, SchedulerError> {
        loop {
            if let Some(exit) = self.exit_reason() {
                return Ok(exit);
            }

            let tick = self.tick()?;
            if tick.assigned == 0 && self.workers.busy_count() == 0 {
                self.idle_ticks += 1;
                if self.idle_ticks >= self.config.stall_grace_ticks.max(1) {
                    let cause = self.stall_cause(tick.deferred);
                    error!(error = %cause, "no progress possible");
                    return Err(cause);
                }
            } else {
                self.idle_ticks = 0;
            }

            self.collect(true)?;
        }
    }

    /// Scarcity is only blamed when the tick actually deferred a worker;
    /// otherwise nothing could ever become runnable again.
    fn stall_cause(&self, deferred: usize) -> SchedulerError {
        let pending_points = self.history.pending_ids().count();
        if deferred > 0 {
            return SchedulerError::ResourceStall {
                free_units: self.resources.free_units(),
                total_units: self.resources.total_units(),
                pending_points,
            };
        }
        SchedulerError::InvariantViolation(format!(
            "scheduler deadlock: {pending_points} pending points, {} waiting generators, {} idle workers",
            self.workers.waiting_gens().len(),
            self.workers.idle_ids().len(),
        ))
    }

    fn exit_reason(&self) -> Option<ExitReason> {
        let criteria = &self.config.exit_criteria;
        if criteria.sim_max.is_some_and(|n| self.history.returned_count() >= n) {
            return Some(ExitReason::SimMaxReached);
        }
        if criteria.gen_max.is_some_and(|n| self.history.len() >= n) {
            return Some(ExitReason::GenMaxReached);
        }
        if criteria
            .wallclock_max_secs
            .is_some_and(|secs| self.started.elapsed().as_secs_f64() >= secs)
        {
            return Some(ExitReason::WallclockReached);
        }
        let generators_done = self.workers.generators_closed() && self.workers.persistent_gen_count() == 0;
        if generators_done && self.workers.busy_count() == 0 && self.history.pending_ids().next().is_none() {
            return Some(ExitReason::GeneratorsFinished);
        }
        None
    }

    /// One allocation tick.
    fn tick(&mut self) -> Result<TickSummary, SchedulerError> {
        let allocation = self
            .allocator
            .allocate(&self.workers, &self.history, &self.resources)?;
        for deferral in &allocation.deferred {
            self.record(
                deferral.worker_id,
                AuditAction::Defer,
                &[],
                Some(format!("requested {} units, {} free", deferral.requested, deferral.free)),
            );
        }
        let summary = TickSummary {
            assigned: allocation.assignments.len(),
            deferred: allocation.deferred.len(),
        };
        if allocation.is_empty() {
            return Ok(summary);
        }

        if let Err(err) = allocation.apply(&mut self.history, &mut self.workers, now_secs()) {
            allocation.release_all(&self.resources)?;
            return Err(err);
        }
        for assignment in allocation.assignments {
            self.dispatch(assignment)?;
        }
        Ok(summary)
    }

    fn dispatch(&mut self, assignment: WorkAssignment) -> Result<(), SchedulerError> {
        let wid = assignment.worker_id();
        let rows = self.history.rows(assignment.history_ids(), assignment.input_fields())?;
        let action = match &assignment {
            WorkAssignment::Sim(_) => AuditAction::Dispatch,
            WorkAssignment::Gen(work) if work.phase == GenPhase::Start => AuditAction::GenStart,
            WorkAssignment::Gen(_) => AuditAction::GenContinue,
        };
        self.record(
            wid,
            action,
            assignment.history_ids(),
            assignment.reservation().map(|h| h.to_string()),
        );
        self.pool.send(Dispatch {
            assignment,
            rows,
            persis_info: self.worker_persis_info(wid),
        })
    }

    /// Merge worker messages: wait up to the poll interval for the first
    /// when `wait` is set, then take whatever else is queued.
    fn collect(&mut self, wait: bool) -> Result<(), SchedulerError> {
        let first = if wait {
            self.pool.recv_timeout(self.config.result_poll())?
        } else {
            self.pool.try_recv()
        };
        let Some(first) = first else {
            return Ok(());
        };
        self.merge(first)?;
        while let Some(result) = self.pool.try_recv() {
            self.merge(result)?;
        }
        Ok(())
    }

    fn merge(&mut self, result: WorkResult) -> Result<(), SchedulerError> {
        let WorkResult {
            worker_id,
            history_ids,
            output,
            status,
            persis_info,
            error,
        } = result;
        self.persis_info.insert(worker_id, persis_info);
        match output {
            WorkOutput::Sim { rows } => self.merge_sim(worker_id, &history_ids, &rows, status, error),
            WorkOutput::Gen {
                points,
                cancel_ids,
                finished,
            } => {
                if status == CalcStatus::Failed {
                    self.fail_gen(worker_id, history_ids, error)
                } else {
                    self.merge_gen(worker_id, points, &cancel_ids, finished)
                }
            }
        }
    }

    fn merge_sim(
        &mut self,
        wid: WorkerId,
        history_ids: &[HistoryId],
        rows: &[Row],
        status: CalcStatus,
        error: Option<String>,
    ) -> Result<(), SchedulerError> {
        let (ids, reservation) = self.workers.finish_sim(wid)?;
        if let Some(handle) = reservation {
            self.resources.release(handle)?;
        }
        if ids != history_ids {
            return Err(SchedulerError::InvariantViolation(format!(
                "worker {wid} replied for points {history_ids:?} but was given {ids:?}"
            )));
        }
        if status == CalcStatus::Failed {
            let message = error.unwrap_or_else(|| "simulator reported failure".into());
            if self.config.abort_on_exception {
                return Err(SchedulerError::CallableException {
                    worker_id: wid,
                    history_ids: ids,
                    message,
                });
            }
            warn!(worker_id = wid, sim_ids = ?ids, error = %message, "marking points failed and continuing");
        }

        let summary = self
            .history
            .merge_results(wid, &ids, rows, status, now_secs())
            .inspect_err(|err| warn!(worker_id = wid, error = %err, "merge rejected"))?;
        debug!(
            worker_id = wid,
            evaluated = summary.evaluated.len(),
            cancelled = summary.cancelled.len(),
            failed = summary.failed.len(),
            "sim results merged"
        );
        self.record(wid, AuditAction::Return, &ids, Some(format!("{status:?}")));
        Ok(())
    }

    fn merge_gen(
        &mut self,
        wid: WorkerId,
        points: Vec<NewPoint>,
        cancel_ids: &[HistoryId],
        finished: bool,
    ) -> Result<(), SchedulerError> {
        let new_ids: Vec<HistoryId> = self.history.append_points(wid, points, now_secs())?.collect();
        self.workers.gen_output(wid, new_ids.iter().copied())?;
        if !new_ids.is_empty() {
            debug!(worker_id = wid, new_points = new_ids.len(), "generator output merged");
        }

        if !cancel_ids.is_empty() {
            let in_flight = cancel_points(&mut self.history, wid, cancel_ids)?;
            let holders: BTreeSet<WorkerId> = in_flight
                .iter()
                .filter_map(|&id| self.history.record(id).map(|r| r.sim_worker))
                .collect();
            for holder in holders {
                self.pool.cancel(holder);
            }
            self.record(wid, AuditAction::Cancel, cancel_ids, None);
        }

        if finished {
            let session = self.workers.terminate_gen(wid)?;
            self.release(session.reservation)?;
            self.workers.close_generators();
            info!(worker_id = wid, rounds = session.rounds, points = session.generated.len(), "generator finished");
            self.record(wid, AuditAction::GenStop, &[], Some("finished".into()));
        } else if self.stopping {
            self.stop_generator(wid)?;
        }
        Ok(())
    }

    fn fail_gen(
        &mut self,
        wid: WorkerId,
        history_ids: Vec<HistoryId>,
        error: Option<String>,
    ) -> Result<(), SchedulerError> {
        let session = self.workers.terminate_gen(wid)?;
        self.release(session.reservation)?;
        // Other sessions keep running; no replacement is started.
        self.workers.close_generators();
        self.record(wid, AuditAction::GenStop, &history_ids, Some("failed".into()));
        let message = error.unwrap_or_else(|| "generator reported failure".into());
        if self.config.abort_on_exception {
            return Err(SchedulerError::CallableException {
                worker_id: wid,
                history_ids,
                message,
            });
        }
        warn!(worker_id = wid, error = %message, "generator session failed, continuing");
        Ok(())
    }

    fn stop_generator(&mut self, wid: WorkerId) -> Result<(), SchedulerError> {
        info!(worker_id = wid, "stopping generator");
        self.pool.stop_gen(wid, self.worker_persis_info(wid))?;
        self.workers.stop_gen(wid)
    }

    /// Stop generators and wait for in-flight work, up to the drain timeout.
    fn drain(&mut self) -> Result<(), SchedulerError> {
        self.stopping = true;
        self.workers.close_generators();
        for wid in self.workers.waiting_gens() {
            self.stop_generator(wid)?;
        }

        let deadline = Instant::now() + self.config.drain_timeout();
        while self.workers.busy_count() > 0 {
            if Instant::now() >= deadline {
                warn!(busy = self.workers.busy_count(), "drain timeout, cancelling remaining work");
                self.pool.cancel_all();
                break;
            }
            self.collect(true)?;
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.release_outstanding();
        self.pool.shutdown();
    }

    fn abort(mut self, cause: SchedulerError) -> RunError {
        error!(error = %cause, "run aborted");
        let in_flight: Vec<HistoryId> = self
            .history
            .iter()
            .filter(|r| r.in_flight())
            .map(|r| r.sim_id)
            .collect();
        if let Err(err) = self.history.request_cancel(&in_flight) {
            warn!(error = %err, "failed to flag in-flight points");
        }
        self.pool.cancel_all();
        self.finish();
        RunError {
            cause,
            history: Box::new(self.history),
            audit_events: self.audit.map(|a| a.events()).unwrap_or_default(),
        }
    }

    /// Give back units still held by workers whose work never came back.
    fn release_outstanding(&mut self) {
        let held: Vec<(WorkerId, ReservationHandle)> = self
            .workers
            .ids()
            .filter_map(|id| {
                let handle = match self.workers.state(id)? {
                    WorkerState::Idle => None,
                    WorkerState::Active { reservation, .. } => *reservation,
                    WorkerState::PersistentActive(session) => session.reservation,
                };
                handle.map(|h| (id, h))
            })
            .collect();
        for (wid, handle) in held {
            match self.resources.release(handle) {
                Ok(()) => debug!(worker_id = wid, %handle, "released outstanding reservation"),
                Err(err) => warn!(worker_id = wid, error = %err, "failed to release outstanding reservation"),
            }
        }
    }

    fn release(&self, handle: Option<ReservationHandle>) -> Result<(), SchedulerError> {
        handle.map_or(Ok(()), |h| self.resources.release(h))
    }

    fn worker_persis_info(&self, wid: WorkerId) -> serde_json::Value {
        self.persis_info.get(&wid).cloned().unwrap_or_default()
    }

    fn record(&mut self, wid: WorkerId, action: AuditAction, ids: &[HistoryId], detail: Option<String>) {
        if let Some(sink) = self.audit.as_mut() {
            sink.record(build_audit_event(wid, action, ids, detail));
        }
    }
}
