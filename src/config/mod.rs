//! Configuration models for runs, resources and exit criteria.

pub mod run;

pub use run::{ExitCriteria, GenSpec, ResourceConfig, RunConfig, SimSpec, DEFAULT_WORKER_STACK_SIZE};
