//! Tests for builder modules

use async_trait::async_trait;
use prometheus_ensemble::builders::ManagerBuilder;
use prometheus_ensemble::config::{GenSpec, RunConfig, SimSpec};
use prometheus_ensemble::core::{
    CallInput, FieldType, GenOutput, Generator, Schema, SchedulerError, SimOutput, Simulator, WorkerContext,
};

struct Echo;

#[async_trait]
impl Simulator for Echo {
    async fn evaluate(&self, _input: CallInput, _ctx: &mut WorkerContext) -> anyhow::Result<SimOutput> {
        Ok(SimOutput::failed())
    }
}

struct Idle;

#[async_trait]
impl Generator for Idle {
    async fn start(&mut self, _ctx: &mut WorkerContext) -> anyhow::Result<GenOutput> {
        Ok(GenOutput::default().finish())
    }

    async fn resume(&mut self, _returned: CallInput, _ctx: &mut WorkerContext) -> anyhow::Result<GenOutput> {
        Ok(GenOutput::default().finish())
    }
}

fn complete(config: RunConfig) -> ManagerBuilder {
    ManagerBuilder::new(config)
        .gen_spec(GenSpec::new(Schema::new().with("x", FieldType::Float)))
        .sim_spec(SimSpec::new(["x"], Schema::new().with("f", FieldType::Float)))
        .generator(|_| Idle)
        .simulator(Echo)
}

fn config() -> RunConfig {
    RunConfig::new().with_workers(2).with_sim_max(10)
}

#[test]
fn test_manager_builder_complete() {
    assert!(complete(config()).build().is_ok());
}

#[test]
fn test_manager_builder_invalid_config() {
    let err = complete(config().with_workers(0)).build().unwrap_err();
    assert!(matches!(err, SchedulerError::Config(_)));
}

#[test]
fn test_manager_builder_missing_simulator() {
    let err = ManagerBuilder::new(config())
        .gen_spec(GenSpec::new(Schema::new().with("x", FieldType::Float)))
        .sim_spec(SimSpec::new(["x"], Schema::new().with("f", FieldType::Float)))
        .generator(|_| Idle)
        .build()
        .unwrap_err();
    assert_eq!(err.to_string(), "invalid configuration: simulator is required");
}

#[test]
fn test_manager_builder_unknown_sim_input() {
    let err = complete(config())
        .sim_spec(SimSpec::new(["y"], Schema::new().with("f", FieldType::Float)))
        .build()
        .unwrap_err();
    assert!(matches!(err, SchedulerError::SchemaMismatch { .. }));
}

#[test]
fn test_manager_builder_conflicting_schemas() {
    let err = complete(config())
        .sim_spec(SimSpec::new(["x"], Schema::new().with("x", FieldType::Int)))
        .build()
        .unwrap_err();
    assert!(matches!(err, SchedulerError::SchemaMismatch { .. }));
}

#[test]
fn test_manager_builder_reserved_fields_accepted() {
    let built = complete(config())
        .gen_spec(GenSpec::new(Schema::new().with("x", FieldType::Float)).with_persis_in(["sim_id", "x", "f"]))
        .build();
    assert!(built.is_ok());
}
