//! Tests for audit sink

use prometheus_ensemble::core::{build_audit_event, AuditAction, AuditSink, InMemoryAuditSink};

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);
    assert!(sink.is_empty());

    sink.record(build_audit_event(2, AuditAction::Dispatch, &[0, 1], Some("#0 (2 units)".into())));
    assert_eq!(sink.len(), 1);

    let events = sink.events();
    assert_eq!(events[0].worker_id, 2);
    assert_eq!(events[0].action, AuditAction::Dispatch);
    assert_eq!(events[0].history_ids, vec![0, 1]);
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event(1, AuditAction::GenStart, &[], None));
    sink.record(build_audit_event(2, AuditAction::Dispatch, &[0], None));
    sink.record(build_audit_event(2, AuditAction::Return, &[0], None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].action, AuditAction::Dispatch); // First one popped
    assert_eq!(events[1].action, AuditAction::Return);
}

#[test]
fn test_zero_capacity_records_nothing() {
    let mut sink = InMemoryAuditSink::new(0);
    sink.record(build_audit_event(1, AuditAction::Defer, &[], None));
    assert!(sink.is_empty());
}

#[test]
fn test_filter_by_action() {
    let mut sink = InMemoryAuditSink::new(10);
    sink.record(build_audit_event(2, AuditAction::Dispatch, &[0], None));
    sink.record(build_audit_event(3, AuditAction::Defer, &[], None));
    sink.record(build_audit_event(3, AuditAction::Dispatch, &[1], None));

    let workers: Vec<usize> = sink.of_action(AuditAction::Dispatch).map(|e| e.worker_id).collect();
    assert_eq!(workers, vec![2, 3]);
}

#[test]
fn test_build_audit_event() {
    let a = build_audit_event(4, AuditAction::GenStop, &[7], Some("finished".to_string()));
    let b = build_audit_event(4, AuditAction::GenStop, &[7], None);

    assert_ne!(a.event_id, b.event_id);
    assert_eq!(a.detail, Some("finished".to_string()));
    assert!(a.created_at_ms > 0);
    assert_eq!(a.action.to_string(), "gen_stop");
}
