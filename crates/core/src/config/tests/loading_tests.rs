use crate::config::models::AppConfig;
use std::env;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[schedule]
evening_run_hour = 18

[retention]
days = 7
"#
    )
    .unwrap();

    let path = file.path().to_str().unwrap().to_string();
    let config = AppConfig::load(Some(&path)).unwrap();
    assert_eq!(config.schedule.evening_run_hour, 18);
    assert_eq!(config.retention.days, 7);
    assert_eq!(config.schedule.morning_run_hour, 4);
}

#[test]
fn test_load_missing_file_fails() {
    assert!(AppConfig::load(Some("/nonexistent/snowcast.toml")).is_err());
}

#[test]
fn test_environment_override() {
    env::set_var("SNOWCAST_PIPELINE__FETCH_WINDOW_HOURS", "48");

    let config = AppConfig::load(None).unwrap();

    env::remove_var("SNOWCAST_PIPELINE__FETCH_WINDOW_HOURS");

    assert_eq!(config.pipeline.fetch_window_hours, 48);
}
