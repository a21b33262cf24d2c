use crate::config::models::*;

#[test]
fn test_invalid_hour_rejected() {
    let mut config = AppConfig::default();
    config.schedule.morning_run_hour = 24;
    assert!(config.validate().is_err());
}

#[test]
fn test_zero_queue_concurrency_rejected() {
    let mut config = AppConfig::default();
    config
        .broker
        .concurrency
        .insert(QUEUE_MODELING.to_string(), 0);
    assert!(config.validate().is_err());
}

#[test]
fn test_missing_queue_rejected() {
    let mut config = AppConfig::default();
    config.broker.concurrency.remove(QUEUE_PIPELINE);
    assert!(config.validate().is_err());
}

#[test]
fn test_soft_limit_must_be_below_hard_limit() {
    let mut config = AppConfig::default();
    config.handlers.annotations.push(HandlerAnnotation {
        name: "pipeline.store_results".to_string(),
        soft_time_limit_seconds: Some(600),
        hard_time_limit_seconds: Some(600),
        ..Default::default()
    });
    assert!(config.validate().is_err());
}

#[test]
fn test_visibility_timeout_must_exceed_hard_limits() {
    let mut config = AppConfig::default();
    config.broker.visibility_timeout_seconds = 1800;
    let err = config.validate().unwrap_err();
    assert!(format!("{err:#}").contains("可见性超时"));
}

#[test]
fn test_zero_rate_limit_rejected() {
    let mut config = AppConfig::default();
    config.handlers.default_rate_limit_per_minute = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_zero_parallelism_rejected() {
    let mut config = AppConfig::default();
    config.simulation.parallelism = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_relative_mount_rejected() {
    let mut config = AppConfig::default();
    config.simulation.output_mount = "output".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_non_sqlite_database_rejected() {
    let mut config = AppConfig::default();
    config.database.url = "postgresql://localhost/snow".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_in_memory_database_detection() {
    let mut config = AppConfig::default();
    assert!(!config.database.is_in_memory());

    config.database.url = "sqlite::memory:".to_string();
    assert!(config.database.is_in_memory());
    assert!(config.validate().is_ok());

    config.database.url = "sqlite://file:snow?mode=memory&cache=shared".to_string();
    assert!(config.database.is_in_memory());
}
