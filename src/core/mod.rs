//! Scheduling core: history, resources, workers, allocation and task execution.

pub mod alloc;
pub mod audit;
pub mod callable;
pub mod error;
pub mod executor;
pub mod history;
pub mod resource_pool;
pub mod schema;
pub mod work;
pub mod worker;
pub mod worker_pool;

pub use alloc::{cancel_points, AllocConfig, Allocation, Allocator, Deferral, PersistentGenAllocator, UnitPolicy};
pub use audit::{build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink};
pub use callable::{
    CallInput, CancelFlag, GenOutput, Generator, GeneratorFactory, SimOutput, Simulator, WorkerContext,
};
pub use error::{AppResult, SchedulerError, TaskError};
pub use executor::{TaskExecutor, TaskHandle, TaskInfo, TaskSpec, TaskState};
pub use history::{History, HistoryId, HistoryRecord, MergeSummary, NewPoint};
pub use resource_pool::{
    Holder, ReservationHandle, ReserveOutcome, ResourcePool, ResourceSnapshot, TaskId,
};
pub use schema::{FieldType, FieldValue, Row, Schema};
pub use work::{CalcStatus, GenPhase, GenWork, Role, SimWork, WorkAssignment, WorkOutput, WorkResult};
pub use worker::{PersistentSession, SessionState, WorkerId, WorkerRegistry, WorkerState};
pub use worker_pool::{Dispatch, WorkerPool};
