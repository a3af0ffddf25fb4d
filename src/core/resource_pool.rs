//! Resource pool with per-unit holder accounting.
//!
//! Units are abstract slots (whole nodes, cores, GPU shares); the pool only
//! counts them and remembers who holds which. Scarcity is a normal outcome
//! reported through [`ReserveOutcome::Insufficient`], while releasing an
//! unknown or already released handle is an accounting bug surfaced as
//! [`SchedulerError::UnknownReservation`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::worker::WorkerId;
use crate::core::SchedulerError;

/// Identifier of a task launched by a task executor.
pub type TaskId = u64;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Who holds a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Holder {
    /// A worker, for a sim dispatch or a generator session.
    Worker(WorkerId),
    /// A task launched by a task executor.
    Task(TaskId),
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker(id) => write!(f, "worker {id}"),
            Self::Task(id) => write!(f, "task {id}"),
        }
    }
}

/// Opaque handle to a live reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationHandle {
    pool: u64,
    id: u64,
    units: u32,
}

impl ReservationHandle {
    /// Number of units held.
    #[must_use]
    pub const fn units(&self) -> u32 {
        self.units
    }

    /// A fresh pool sized to this reservation, for the holder to sub-divide
    /// (a worker's task executor draws from it).
    #[must_use]
    pub fn scoped_pool(&self) -> ResourcePool {
        ResourcePool::new(self.units)
    }
}

impl fmt::Display for ReservationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{} ({} units)", self.pool, self.id, self.units)
    }
}

/// Result of a reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ReserveOutcome {
    /// Units were reserved.
    Reserved(ReservationHandle),
    /// Not enough free units; nothing was reserved.
    Insufficient {
        /// Units requested.
        requested: u32,
        /// Units free at the time of the request.
        free: u32,
    },
}

impl ReserveOutcome {
    /// The handle, if the reservation succeeded.
    #[must_use]
    pub const fn handle(self) -> Option<ReservationHandle> {
        match self {
            Self::Reserved(handle) => Some(handle),
            Self::Insufficient { .. } => None,
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Pool capacity.
    pub total_units: u32,
    /// Units not held by anyone.
    pub free_units: u32,
    /// Live reservations in creation order.
    pub holders: Vec<(Holder, u32)>,
}

struct Reservation {
    holder: Holder,
    slots: Vec<usize>,
}

struct PoolState {
    /// Unit index → reservation id.
    slots: Vec<Option<u64>>,
    reservations: HashMap<u64, Reservation>,
    next_id: u64,
}

/// Fixed pool of schedulable resource units.
///
/// Reservation and release take a `parking_lot::Mutex` so no two callers can
/// claim the same unit; the reserved count is mirrored in an `AtomicU32` for
/// lock-free reads.
pub struct ResourcePool {
    id: u64,
    total_units: u32,
    state: Mutex<PoolState>,
    reserved_units: AtomicU32,
}

impl ResourcePool {
    /// Create a pool of `total_units` free units.
    #[must_use]
    pub fn new(total_units: u32) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            total_units,
            state: Mutex::new(PoolState {
                slots: vec![None; total_units as usize],
                reservations: HashMap::new(),
                next_id: 0,
            }),
            reserved_units: AtomicU32::new(0),
        }
    }

    /// Pool capacity.
    #[must_use]
    pub const fn total_units(&self) -> u32 {
        self.total_units
    }

    /// Units currently free (lock-free read).
    #[must_use]
    pub fn free_units(&self) -> u32 {
        self.total_units - self.reserved_units.load(Ordering::Acquire)
    }

    /// Check whether `units` could be reserved right now, without locking.
    #[must_use]
    pub fn can_reserve(&self, units: u32) -> bool {
        units <= self.free_units()
    }

    /// Reserve `units` for `holder`, all or nothing. The lowest free unit
    /// indices are taken.
    pub fn reserve(&self, units: u32, holder: Holder) -> ReserveOutcome {
        let mut state = self.state.lock();
        let free = self.total_units - self.reserved_units.load(Ordering::Acquire);
        if units > free {
            tracing::debug!(requested = units, free, %holder, "insufficient free units");
            return ReserveOutcome::Insufficient {
                requested: units,
                free,
            };
        }

        let id = state.next_id;
        state.next_id += 1;
        let slots: Vec<usize> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.is_none())
            .map(|(idx, _)| idx)
            .take(units as usize)
            .collect();
        for &slot in &slots {
            state.slots[slot] = Some(id);
        }
        state.reservations.insert(id, Reservation { holder, slots });
        self.reserved_units.fetch_add(units, Ordering::AcqRel);

        tracing::debug!(reservation = id, units, %holder, free = free - units, "reserved units");
        ReserveOutcome::Reserved(ReservationHandle {
            pool: self.id,
            id,
            units,
        })
    }

    /// Release a reservation. Each handle may be released exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownReservation`] for a handle that was
    /// already released, never issued by this pool, or whose unit count
    /// does not match the live reservation.
    pub fn release(&self, handle: ReservationHandle) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if !Self::is_live(&state, self.id, handle) {
            tracing::error!(%handle, "release of unknown reservation");
            return Err(SchedulerError::UnknownReservation { handle });
        }
        let Some(reservation) = state.reservations.remove(&handle.id) else {
            return Err(SchedulerError::UnknownReservation { handle });
        };
        for &slot in &reservation.slots {
            state.slots[slot] = None;
        }
        let units = u32::try_from(reservation.slots.len()).unwrap_or(u32::MAX);
        self.reserved_units.fetch_sub(units, Ordering::AcqRel);
        tracing::debug!(%handle, holder = %reservation.holder, "released units");
        Ok(())
    }

    fn is_live(state: &PoolState, pool: u64, handle: ReservationHandle) -> bool {
        handle.pool == pool
            && state
                .reservations
                .get(&handle.id)
                .is_some_and(|r| r.slots.len() == handle.units as usize)
    }

    /// Current holder of unit `index`.
    #[must_use]
    pub fn holder_of(&self, index: usize) -> Option<Holder> {
        let state = self.state.lock();
        let id = (*state.slots.get(index)?)?;
        state.reservations.get(&id).map(|r| r.holder)
    }

    /// Unit indices covered by a live reservation.
    #[must_use]
    pub fn units_of(&self, handle: ReservationHandle) -> Option<Vec<usize>> {
        let state = self.state.lock();
        if !Self::is_live(&state, self.id, handle) {
            return None;
        }
        state.reservations.get(&handle.id).map(|r| r.slots.clone())
    }

    /// Number of live reservations.
    #[must_use]
    pub fn live_reservations(&self) -> usize {
        self.state.lock().reservations.len()
    }

    /// Point-in-time view of capacity and holders.
    #[must_use]
    pub fn snapshot(&self) -> ResourceSnapshot {
        let state = self.state.lock();
        let mut live: Vec<_> = state.reservations.iter().collect();
        live.sort_by_key(|(id, _)| **id);
        ResourceSnapshot {
            total_units: self.total_units,
            free_units: self.free_units(),
            holders: live
                .into_iter()
                .map(|(_, r)| (r.holder, u32::try_from(r.slots.len()).unwrap_or(u32::MAX)))
                .collect(),
        }
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("total_units", &self.total_units)
            .field("free_units", &self.free_units())
            .finish_non_exhaustive()
    }
}
