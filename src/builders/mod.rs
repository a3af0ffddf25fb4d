//! Builders to construct a run from configuration.

pub mod manager_builder;

pub use manager_builder::ManagerBuilder;
