//! Allocation engine: decides, once per tick, what every available worker
//! does next.
//!
//! The shipped policy, [`PersistentGenAllocator`], runs persistent
//! generators and hands their points to one-shot simulator workers:
//!
//! 1. A waiting generator whose oldest undelivered batch has fully resolved
//!    gets that batch back as a continuation, ascending by id, once. An
//!    output with no points is answered by one empty continuation.
//! 2. Each idle worker takes the pending sub-batch with the lowest tag.
//! 3. With nothing pending, an idle worker starts a new generator session
//!    while fewer than `max_persistent_gens` are running and generators have
//!    not been closed for the run.
//! 4. Every assignment that needs resource units reserves them first. On
//!    scarcity the worker is skipped for this tick and the engine moves on.
//!
//! Workers are visited in ascending id order and a tick never blocks.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::history::{History, HistoryId, HistoryRecord};
use crate::core::resource_pool::{Holder, ReservationHandle, ReserveOutcome, ResourcePool};
use crate::core::work::{GenPhase, GenWork, Role, SimWork, WorkAssignment};
use crate::core::worker::{PersistentSession, WorkerId, WorkerRegistry};
use crate::core::SchedulerError;

/// Allocation policy knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocConfig {
    /// Upper bound on concurrently running generator sessions.
    pub max_persistent_gens: usize,
    /// Feed each returned point back as soon as it returns instead of
    /// waiting for its whole batch.
    pub async_return: bool,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            max_persistent_gens: 1,
            async_return: false,
        }
    }
}

/// Resource units each kind of assignment asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitPolicy {
    /// Units for a point without its own `resource_sets`.
    pub default_units_per_point: u32,
    /// Units held by each generator session.
    pub gen_units: u32,
}

/// A worker skipped this tick for lack of free units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deferral {
    /// Skipped worker.
    pub worker_id: WorkerId,
    /// Role it would have taken.
    pub role: Role,
    /// Units it needed.
    pub requested: u32,
    /// Units that were free.
    pub free: u32,
}

/// Output of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    /// At most one assignment per worker, in worker-visit order.
    pub assignments: Vec<WorkAssignment>,
    /// Workers skipped on scarcity.
    pub deferred: Vec<Deferral>,
}

impl Allocation {
    /// Whether the tick produced no assignment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Commit the allocation: mark dispatched points `given` and move the
    /// target workers to their new states.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvariantViolation`] if the allocation no
    /// longer fits the history or worker states.
    pub fn apply(
        &self,
        history: &mut History,
        workers: &mut WorkerRegistry,
        now: f64,
    ) -> Result<(), SchedulerError> {
        for assignment in &self.assignments {
            match assignment {
                WorkAssignment::Sim(work) => {
                    history.mark_given(&work.history_ids, work.worker_id, now)?;
                    workers.start_sim(work.worker_id, work.history_ids.clone(), work.reservation)?;
                }
                WorkAssignment::Gen(work) => match work.phase {
                    GenPhase::Start => workers.start_gen(work.worker_id, work.reservation)?,
                    GenPhase::Continue => workers.continue_gen(work.worker_id, &work.history_ids)?,
                },
            }
        }
        Ok(())
    }

    /// Give back every reservation this allocation took. Used when an
    /// allocation is discarded instead of applied.
    ///
    /// # Errors
    ///
    /// Propagates [`SchedulerError::UnknownReservation`].
    pub fn release_all(&self, resources: &ResourcePool) -> Result<(), SchedulerError> {
        for handle in self.assignments.iter().filter_map(WorkAssignment::reservation) {
            resources.release(handle)?;
        }
        Ok(())
    }
}

/// A scheduling policy.
pub trait Allocator: Send {
    /// Compute this tick's assignments. Must not block. Reservations for the
    /// returned assignments are already taken from `resources`.
    ///
    /// # Errors
    ///
    /// Only genuine errors (unknown fields, broken invariants) are returned;
    /// scarcity shows up as [`Allocation::deferred`].
    fn allocate(
        &mut self,
        workers: &WorkerRegistry,
        history: &History,
        resources: &ResourcePool,
    ) -> Result<Allocation, SchedulerError>;
}

/// Persistent generators feeding one-shot simulator workers.
#[derive(Debug, Clone)]
pub struct PersistentGenAllocator {
    config: AllocConfig,
    units: UnitPolicy,
    sim_inputs: Vec<String>,
    gen_inputs: Vec<String>,
}

impl PersistentGenAllocator {
    /// Create the policy. `sim_inputs` are shipped with simulator work,
    /// `gen_inputs` with continuations.
    #[must_use]
    pub const fn new(
        config: AllocConfig,
        units: UnitPolicy,
        sim_inputs: Vec<String>,
        gen_inputs: Vec<String>,
    ) -> Self {
        Self {
            config,
            units,
            sim_inputs,
            gen_inputs,
        }
    }

    /// Ids to feed back to `session` now, if a group is complete.
    fn completed_group(&self, session: &PersistentSession, history: &History) -> Option<Vec<HistoryId>> {
        let undelivered: Vec<&HistoryRecord> = session
            .generated
            .iter()
            .filter(|id| !session.delivered.contains(id))
            .filter_map(|&id| history.record(id))
            .collect();

        if undelivered.is_empty() {
            return session.empty_output.then(Vec::new);
        }

        if self.config.async_return {
            let ready: Vec<HistoryId> = undelivered
                .iter()
                .filter(|r| r.is_resolved())
                .map(|r| r.sim_id)
                .collect();
            return (!ready.is_empty()).then_some(ready);
        }

        let batch = undelivered.iter().map(|r| r.batch).min()?;
        let group: Vec<&HistoryRecord> = undelivered.into_iter().filter(|r| r.batch == batch).collect();
        if !group.iter().all(|r| r.is_resolved()) {
            return None;
        }
        let mut ids: Vec<HistoryId> = group.iter().map(|r| r.sim_id).collect();
        ids.sort_unstable();
        Some(ids)
    }

    fn units_for(&self, records: &[&HistoryRecord]) -> u32 {
        records
            .iter()
            .map(|r| r.resource_sets.unwrap_or(self.units.default_units_per_point))
            .max()
            .unwrap_or(0)
    }
}

impl Allocator for PersistentGenAllocator {
    fn allocate(
        &mut self,
        workers: &WorkerRegistry,
        history: &History,
        resources: &ResourcePool,
    ) -> Result<Allocation, SchedulerError> {
        let mut out = Allocation::default();

        for wid in workers.waiting_gens() {
            let Some(session) = workers.session(wid) else {
                continue;
            };
            if let Some(ids) = self.completed_group(session, history) {
                info!(worker_id = wid, points = ids.len(), "returning completed group to generator");
                out.assignments.push(WorkAssignment::Gen(GenWork {
                    worker_id: wid,
                    phase: GenPhase::Continue,
                    history_ids: ids,
                    input_fields: self.gen_inputs.clone(),
                    reservation: None,
                }));
            }
        }

        // Pending points grouped by sub-batch, lowest tag first, ids ascending.
        let mut by_subbatch: BTreeMap<i64, Vec<&HistoryRecord>> = BTreeMap::new();
        for record in history.iter().filter(|r| r.is_pending()) {
            by_subbatch.entry(record.subbatch).or_default().push(record);
        }
        let mut taken: BTreeSet<i64> = BTreeSet::new();
        let mut gen_count = workers.persistent_gen_count();

        for wid in workers.idle_ids() {
            let next = by_subbatch.iter().find(|(tag, _)| !taken.contains(*tag));
            if let Some((&tag, records)) = next {
                let units = self.units_for(records);
                let Some(reservation) = reserve(resources, units, wid, Role::Sim, &mut out) else {
                    continue;
                };
                taken.insert(tag);
                let history_ids: Vec<HistoryId> = records.iter().map(|r| r.sim_id).collect();
                debug!(worker_id = wid, subbatch = tag, sim_ids = ?history_ids, units, "dispatching sim work");
                out.assignments.push(WorkAssignment::Sim(SimWork {
                    worker_id: wid,
                    history_ids,
                    input_fields: self.sim_inputs.clone(),
                    reservation,
                }));
            } else if !workers.generators_closed() && gen_count < self.config.max_persistent_gens {
                let units = self.units.gen_units;
                let Some(reservation) = reserve(resources, units, wid, Role::Gen, &mut out) else {
                    continue;
                };
                gen_count += 1;
                info!(worker_id = wid, units, "starting persistent generator");
                out.assignments.push(WorkAssignment::Gen(GenWork {
                    worker_id: wid,
                    phase: GenPhase::Start,
                    history_ids: Vec::new(),
                    input_fields: self.gen_inputs.clone(),
                    reservation,
                }));
            }
        }

        Ok(out)
    }
}

/// Reserve `units` for `wid`. `Some(None)` means no units were needed,
/// `None` means the worker was deferred.
fn reserve(
    resources: &ResourcePool,
    units: u32,
    wid: WorkerId,
    role: Role,
    out: &mut Allocation,
) -> Option<Option<ReservationHandle>> {
    if units == 0 {
        return Some(None);
    }
    match resources.reserve(units, Holder::Worker(wid)) {
        ReserveOutcome::Reserved(handle) => Some(Some(handle)),
        ReserveOutcome::Insufficient { requested, free } => {
            debug!(worker_id = wid, ?role, requested, free, "deferring worker on insufficient resources");
            out.deferred.push(Deferral {
                worker_id: wid,
                role,
                requested,
                free,
            });
            None
        }
    }
}

/// Flag points a generator no longer needs. A generator may only cancel
/// its own points. Returns the ids that are currently in flight.
///
/// # Errors
///
/// Returns [`SchedulerError::InvariantViolation`] for unknown ids or ids
/// produced by another worker.
pub fn cancel_points(
    history: &mut History,
    gen_worker: WorkerId,
    ids: &[HistoryId],
) -> Result<Vec<HistoryId>, SchedulerError> {
    for &id in ids {
        match history.record(id) {
            Some(record) if record.gen_worker == gen_worker => {}
            Some(record) => {
                return Err(SchedulerError::InvariantViolation(format!(
                    "worker {gen_worker} cannot cancel point {id} generated by worker {}",
                    record.gen_worker
                )));
            }
            None => {
                return Err(SchedulerError::InvariantViolation(format!(
                    "cancel request for unknown point {id}"
                )));
            }
        }
    }
    let in_flight = history.request_cancel(ids)?;
    if !ids.is_empty() {
        info!(worker_id = gen_worker, requested = ids.len(), in_flight = in_flight.len(), "points cancelled");
    }
    Ok(in_flight)
}
