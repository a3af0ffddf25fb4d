//! Run driver.

pub mod manager;

pub use manager::{ExitReason, Manager, RunError, RunOutcome};
