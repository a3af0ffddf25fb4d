//! Tests for error types

use prometheus_ensemble::core::{SchedulerError, TaskError};

#[test]
fn test_callable_exception_error() {
    let err = SchedulerError::CallableException {
        worker_id: 3,
        history_ids: vec![4, 5],
        message: "diverged".to_string(),
    };
    assert_eq!(format!("{}", err), "callable failed on worker 3 (history ids 4..=5): diverged");
}

#[test]
fn test_resource_stall_error() {
    let err = SchedulerError::ResourceStall {
        free_units: 2,
        total_units: 4,
        pending_points: 1,
    };
    assert_eq!(
        format!("{}", err),
        "resource exhaustion stall: 1 pending points, 2/4 units free"
    );
}

#[test]
fn test_schema_mismatch_error() {
    let err = SchedulerError::SchemaMismatch {
        context: "sim output of worker 2".to_string(),
        detail: "missing field `f`".to_string(),
    };
    assert_eq!(format!("{}", err), "schema mismatch in sim output of worker 2: missing field `f`");
}

#[test]
fn test_invariant_violation_error() {
    let err = SchedulerError::InvariantViolation("duplicate merge".to_string());
    assert_eq!(format!("{}", err), "invariant violation: duplicate merge");
}

#[test]
fn test_task_error_wraps_scheduler_error() {
    let err: TaskError = SchedulerError::Config("bad".into()).into();
    assert_eq!(format!("{}", err), "invalid configuration: bad");

    let err = TaskError::InsufficientResources { requested: 3, free: 1 };
    assert_eq!(format!("{}", err), "insufficient resources: requested 3, free 1");
}
