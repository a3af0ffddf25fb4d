//! # Prometheus Ensemble
//!
//! A resource-aware scheduler for generator/simulator ensembles.
//!
//! A run coordinates a pool of workers evaluating two kinds of user code:
//! *generators* that propose candidate points and *simulators* that evaluate
//! them. Every point lives in one append-only history owned by the manager.
//! Each scheduling tick the allocation engine looks at the history and the
//! worker states, reserves resource units, and decides what every available
//! worker does next.
//!
//! ## Key Features
//!
//! - **Persistent generators**: a generator session stays alive on its
//!   worker and receives each completed batch of results exactly once
//! - **Resource-aware dispatch**: points carry a unit request; scarcity
//!   defers a worker to a later tick instead of failing the run
//! - **Single-writer history**: invariant-checked transitions for dispatch,
//!   merge and cancellation
//! - **Task executor**: launch external processes from a simulator with
//!   timeouts, kill escalation and exactly-once unit release
//! - **Dedicated worker threads**: each worker runs its callables on its own
//!   single-threaded tokio runtime
//!
//! ## Example
//!
//! ```rust,ignore
//! use prometheus_ensemble::builders::ManagerBuilder;
//! use prometheus_ensemble::config::{GenSpec, RunConfig, SimSpec};
//! use prometheus_ensemble::core::{FieldType, Schema};
//!
//! let config = RunConfig::new().with_workers(4).with_sim_max(200);
//! let outcome = ManagerBuilder::new(config)
//!     .gen_spec(GenSpec::new(Schema::new().with("x", FieldType::FloatVec(2))))
//!     .sim_spec(SimSpec::new(["x"], Schema::new().with("f", FieldType::Float)))
//!     .generator(|_worker| UniformSampler::new(16))
//!     .simulator(SixHumpCamel)
//!     .audit_capacity(1_000)
//!     .build()?
//!     .run()?;
//!
//! println!("{} points evaluated", outcome.history.returned_count());
//! ```
//!
//! For complete examples, see:
//! - `tests/manager_test.rs` - end-to-end runs
//! - `tests/allocation_test.rs` - allocation scenarios

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions and capacity accounting.
pub mod core;
/// Configuration models for runs, resources and exit criteria.
pub mod config;
/// Builders to construct a run from configuration.
pub mod builders;
/// Run driver.
pub mod runtime;
/// Shared utilities.
pub mod util;
