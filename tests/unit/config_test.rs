//! Tests for configuration validation

use prometheus_ensemble::config::{ResourceConfig, RunConfig};
use prometheus_ensemble::core::AllocConfig;

fn valid() -> RunConfig {
    RunConfig::new().with_workers(4).with_sim_max(100).with_resources(ResourceConfig {
        total_units: 8,
        default_units_per_point: 1,
        gen_units: 1,
    })
}

#[test]
fn test_run_config_validation() {
    assert!(valid().validate().is_ok());
}

#[test]
fn test_run_config_invalid_workers() {
    assert!(valid().with_workers(0).validate().is_err());
}

#[test]
fn test_run_config_invalid_wallclock() {
    let err = valid().with_wallclock_max(0.0).validate().unwrap_err();
    assert!(err.contains("wallclock_max_secs"));
}

#[test]
fn test_run_config_units_per_point_bounded() {
    let cfg = valid().with_resources(ResourceConfig {
        total_units: 2,
        default_units_per_point: 3,
        gen_units: 0,
    });
    assert!(cfg.validate().unwrap_err().contains("default_units_per_point"));
}

#[test]
fn test_run_config_too_many_generators() {
    let cfg = valid().with_alloc(AllocConfig {
        max_persistent_gens: 4,
        async_return: false,
    });
    assert!(cfg.validate().is_err());
    assert!(cfg.with_workers(5).validate().is_ok());
}

#[test]
fn test_run_config_from_json() {
    let json = r#"{
        "nworkers": 5,
        "resources": { "total_units": 16, "default_units_per_point": 2, "gen_units": 4 },
        "alloc": { "max_persistent_gens": 2, "async_return": true },
        "exit_criteria": { "sim_max": 500, "wallclock_max_secs": 3600.0 },
        "abort_on_exception": false
    }"#;

    let config = RunConfig::from_json_str(json).unwrap();
    assert_eq!(config.nworkers, 5);
    assert_eq!(config.resources.unit_policy().gen_units, 4);
    assert!(config.alloc.async_return);
    assert_eq!(config.exit_criteria.wallclock_max_secs, Some(3600.0));
    assert!(!config.abort_on_exception);
    assert_eq!(config.result_poll_ms, 50);
}

#[test]
fn test_run_config_from_json_rejects_invalid() {
    let err = RunConfig::from_json_str(r#"{"nworkers": 2}"#).unwrap_err();
    assert!(err.contains("exit criterion"));
    assert!(RunConfig::from_json_str("not json").unwrap_err().starts_with("parse error"));
}

#[test]
fn test_run_config_env_overrides() {
    std::env::set_var("ENSEMBLE_NWORKERS", "7");
    std::env::set_var("ENSEMBLE_SIM_MAX", "42");
    let mut cfg = valid();
    cfg.apply_env_overrides().unwrap();
    std::env::remove_var("ENSEMBLE_NWORKERS");
    std::env::remove_var("ENSEMBLE_SIM_MAX");

    assert_eq!(cfg.nworkers, 7);
    assert_eq!(cfg.exit_criteria.sim_max, Some(42));
    assert_eq!(cfg.resources.total_units, 8);
}
