//! Worker bookkeeping: liveness, roles and persistent generator sessions.
//!
//! A persistent session moves through
//! `Idle → AwaitingFirstOutput → AwaitingContinuation ⇄ AwaitingOutput → Terminated`.
//! The allocation engine's committed assignments and the manager's merge
//! step drive these transitions; every transition checks the current state
//! and reports an [`SchedulerError::InvariantViolation`] when called out of
//! order.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::history::HistoryId;
use crate::core::resource_pool::ReservationHandle;
use crate::core::work::Role;
use crate::core::SchedulerError;

/// Small integer worker identifier. Workers are numbered from 1; 0 means none.
pub type WorkerId = usize;

/// Lifecycle of a persistent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet started.
    Idle,
    /// Started; the first output has not arrived.
    AwaitingFirstOutput,
    /// Output merged; waiting for the scheduler to feed results back.
    AwaitingContinuation,
    /// Results fed back; the next output has not arrived.
    AwaitingOutput,
    /// Ended; the worker is idle again.
    Terminated,
}

/// A long-lived generator (or simulator) session on one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSession {
    /// Role of the session.
    pub role: Role,
    /// Current state.
    pub state: SessionState,
    /// History ids generated under this session, ascending.
    pub generated: Vec<HistoryId>,
    /// Ids already fed back to the session.
    pub delivered: BTreeSet<HistoryId>,
    /// Units held for the whole session.
    pub reservation: Option<ReservationHandle>,
    /// Number of continuations sent.
    pub rounds: u32,
    /// The latest output carried no points and has not been answered yet.
    pub empty_output: bool,
}

impl PersistentSession {
    fn new(role: Role, reservation: Option<ReservationHandle>) -> Self {
        Self {
            role,
            state: SessionState::Idle,
            generated: Vec::new(),
            delivered: BTreeSet::new(),
            reservation,
            rounds: 0,
            empty_output: false,
        }
    }

    /// Whether the session is currently computing.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(
            self.state,
            SessionState::AwaitingFirstOutput | SessionState::AwaitingOutput
        )
    }
}

/// State of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Ready for any assignment.
    Idle,
    /// Running a one-shot assignment.
    Active {
        /// Role of the assignment.
        role: Role,
        /// Ids being evaluated.
        history_ids: Vec<HistoryId>,
        /// Units held for the assignment.
        reservation: Option<ReservationHandle>,
    },
    /// Hosting a persistent session.
    PersistentActive(PersistentSession),
}

/// All workers of a run, visited in ascending id order.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<WorkerId, WorkerState>,
    gens_closed: bool,
}

impl WorkerRegistry {
    /// Registry of `count` idle workers numbered `1..=count`.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            workers: (1..=count).map(|id| (id, WorkerState::Idle)).collect(),
            gens_closed: false,
        }
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// State of `id`.
    #[must_use]
    pub fn state(&self, id: WorkerId) -> Option<&WorkerState> {
        self.workers.get(&id)
    }

    /// Persistent session on `id`, if any.
    #[must_use]
    pub fn session(&self, id: WorkerId) -> Option<&PersistentSession> {
        match self.workers.get(&id) {
            Some(WorkerState::PersistentActive(session)) => Some(session),
            _ => None,
        }
    }

    /// Idle worker ids, ascending.
    #[must_use]
    pub fn idle_ids(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, s)| matches!(s, WorkerState::Idle))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Persistent generators waiting for a continuation, ascending.
    #[must_use]
    pub fn waiting_gens(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, s)| {
                matches!(s, WorkerState::PersistentActive(session)
                    if session.role == Role::Gen && session.state == SessionState::AwaitingContinuation)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Live persistent generator sessions.
    #[must_use]
    pub fn persistent_gen_count(&self) -> usize {
        self.workers
            .values()
            .filter(|s| matches!(s, WorkerState::PersistentActive(session) if session.role == Role::Gen))
            .count()
    }

    /// Workers currently computing something.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.workers
            .values()
            .filter(|s| match s {
                WorkerState::Idle => false,
                WorkerState::Active { .. } => true,
                WorkerState::PersistentActive(session) => session.is_busy(),
            })
            .count()
    }

    /// Whether new generator sessions may no longer be started, because a
    /// generator declared itself finished or the run is ending.
    #[must_use]
    pub const fn generators_closed(&self) -> bool {
        self.gens_closed
    }

    /// Forbid new generator sessions for the rest of the run.
    pub fn close_generators(&mut self) {
        self.gens_closed = true;
    }

    /// Ids of all workers in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.workers.keys().copied()
    }

    /// Idle worker starts evaluating `history_ids`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvariantViolation`] if the worker is unknown or busy.
    pub fn start_sim(
        &mut self,
        id: WorkerId,
        history_ids: Vec<HistoryId>,
        reservation: Option<ReservationHandle>,
    ) -> Result<(), SchedulerError> {
        let state = self.idle_slot(id, "sim dispatch")?;
        *state = WorkerState::Active {
            role: Role::Sim,
            history_ids,
            reservation,
        };
        Ok(())
    }

    /// A simulator reply arrived; the worker is idle again. Returns the ids
    /// it was evaluating and the reservation to release.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvariantViolation`] if the worker was not running a sim.
    pub fn finish_sim(
        &mut self,
        id: WorkerId,
    ) -> Result<(Vec<HistoryId>, Option<ReservationHandle>), SchedulerError> {
        let state = self.slot(id)?;
        match std::mem::replace(state, WorkerState::Idle) {
            WorkerState::Active {
                role: Role::Sim,
                history_ids,
                reservation,
            } => Ok((history_ids, reservation)),
            other => {
                *state = other;
                Err(SchedulerError::InvariantViolation(format!(
                    "worker {id} returned sim results but is not running a sim"
                )))
            }
        }
    }

    /// Idle worker starts a generator session.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvariantViolation`] if the worker is unknown or busy.
    pub fn start_gen(
        &mut self,
        id: WorkerId,
        reservation: Option<ReservationHandle>,
    ) -> Result<(), SchedulerError> {
        let state = self.idle_slot(id, "generator start")?;
        let mut session = PersistentSession::new(Role::Gen, reservation);
        session.state = SessionState::AwaitingFirstOutput;
        *state = WorkerState::PersistentActive(session);
        Ok(())
    }

    /// A generator output was merged as `new_ids`; the session now waits for
    /// a continuation.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvariantViolation`] if the session was not computing.
    pub fn gen_output(
        &mut self,
        id: WorkerId,
        new_ids: impl IntoIterator<Item = HistoryId>,
    ) -> Result<(), SchedulerError> {
        let session = self.gen_session(id)?;
        if !session.is_busy() {
            return Err(SchedulerError::InvariantViolation(format!(
                "worker {id} sent generator output while in {:?}",
                session.state
            )));
        }
        let before = session.generated.len();
        session.generated.extend(new_ids);
        session.empty_output = session.generated.len() == before;
        session.state = SessionState::AwaitingContinuation;
        Ok(())
    }

    /// A continuation carrying `delivered` was sent.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvariantViolation`] if the session was not waiting or
    /// a point was already fed back.
    pub fn continue_gen(
        &mut self,
        id: WorkerId,
        delivered: &[HistoryId],
    ) -> Result<(), SchedulerError> {
        let session = self.gen_session(id)?;
        if session.state != SessionState::AwaitingContinuation {
            return Err(SchedulerError::InvariantViolation(format!(
                "continuation for worker {id} while in {:?}",
                session.state
            )));
        }
        for &hid in delivered {
            if !session.delivered.insert(hid) {
                return Err(SchedulerError::InvariantViolation(format!(
                    "point {hid} already fed back to worker {id}"
                )));
            }
        }
        session.rounds += 1;
        session.empty_output = false;
        session.state = SessionState::AwaitingOutput;
        Ok(())
    }

    /// A stop was sent to a waiting session; its final output is awaited.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvariantViolation`] if the session was not waiting.
    pub fn stop_gen(&mut self, id: WorkerId) -> Result<(), SchedulerError> {
        let session = self.gen_session(id)?;
        if session.state != SessionState::AwaitingContinuation {
            return Err(SchedulerError::InvariantViolation(format!(
                "stop for worker {id} while in {:?}",
                session.state
            )));
        }
        session.state = SessionState::AwaitingOutput;
        Ok(())
    }

    /// End the session on `id`; the worker becomes idle.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvariantViolation`] if there is no session.
    pub fn terminate_gen(&mut self, id: WorkerId) -> Result<PersistentSession, SchedulerError> {
        let state = self.slot(id)?;
        match std::mem::replace(state, WorkerState::Idle) {
            WorkerState::PersistentActive(mut session) => {
                session.state = SessionState::Terminated;
                Ok(session)
            }
            other => {
                *state = other;
                Err(SchedulerError::InvariantViolation(format!(
                    "worker {id} has no persistent session to terminate"
                )))
            }
        }
    }

    fn slot(&mut self, id: WorkerId) -> Result<&mut WorkerState, SchedulerError> {
        self.workers
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::InvariantViolation(format!("unknown worker {id}")))
    }

    fn idle_slot(&mut self, id: WorkerId, what: &str) -> Result<&mut WorkerState, SchedulerError> {
        let state = self.slot(id)?;
        if *state != WorkerState::Idle {
            return Err(SchedulerError::InvariantViolation(format!(
                "{what} for busy worker {id}"
            )));
        }
        Ok(state)
    }

    fn gen_session(&mut self, id: WorkerId) -> Result<&mut PersistentSession, SchedulerError> {
        match self.slot(id)? {
            WorkerState::PersistentActive(session) if session.role == Role::Gen => Ok(session),
            _ => Err(SchedulerError::InvariantViolation(format!(
                "worker {id} is not hosting a generator session"
            ))),
        }
    }
}
