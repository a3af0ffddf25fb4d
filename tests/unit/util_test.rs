//! Tests for utility functions

use prometheus_ensemble::util::{init_tracing, now_ms, now_secs};

#[test]
fn test_clock_units_agree() {
    let ms = now_ms();
    let secs = now_secs();
    assert!(ms > 0);
    #[allow(clippy::cast_precision_loss)]
    let diff = (secs - ms as f64 / 1000.0).abs();
    assert!(diff < 5.0);
}

#[test]
fn test_init_tracing_idempotent() {
    init_tracing();
    init_tracing();
    tracing::info!("tracing initialized twice without panicking");
}
