use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use snowcast_core::{
    config::HandlersConfig,
    models::{FetchParams, TaskStatus, TimeRange},
    BackoffDecision, SchedulerError, TaskCatalog, HANDLER_FETCH_OBSERVATIONS,
};
use uuid::Uuid;

#[test]
fn test_fetch_task_retry_sequence() {
    let catalog = TaskCatalog::standard(&HandlersConfig::default()).unwrap();
    let spec = catalog.spec(HANDLER_FETCH_OBSERVATIONS).unwrap();
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 4, 0, 0).unwrap();
    let mut task = catalog
        .new_task(HANDLER_FETCH_OBSERVATIONS, json!({}), now)
        .unwrap();

    let mut delays = Vec::new();
    loop {
        match spec.backoff.decide(task.attempt_count) {
            BackoffDecision::Retry { delay } => {
                task.schedule_retry(delay, now).unwrap();
                delays.push(delay.as_secs());
            }
            BackoffDecision::GiveUp => {
                task.mark_failed("No data returned", now);
                break;
            }
        }
    }

    assert_eq!(delays, vec![60, 120, 240]);
    assert_eq!(task.attempt_count, task.max_attempts);
    assert_eq!(task.status, TaskStatus::FailedPermanent);
}

#[test]
fn test_attempt_count_never_exceeds_max() {
    let catalog = TaskCatalog::standard(&HandlersConfig::default()).unwrap();
    let now = Utc::now();
    let mut task = catalog
        .new_task(HANDLER_FETCH_OBSERVATIONS, json!({}), now)
        .unwrap();

    for _ in 0..10 {
        let _ = task.schedule_retry(Duration::from_secs(1), now);
        assert!(task.attempt_count <= task.max_attempts);
    }
}

#[test]
fn test_payload_round_trip_through_task() {
    let catalog = TaskCatalog::standard(&HandlersConfig::default()).unwrap();
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 16, 0, 0).unwrap();
    let params = FetchParams {
        run_id: Uuid::new_v4(),
        station_ids: vec!["WBB".to_string(), "MTMET".to_string()],
        time_range: TimeRange::trailing(now, chrono::Duration::hours(24)),
    };
    let task = catalog
        .new_task(
            HANDLER_FETCH_OBSERVATIONS,
            serde_json::to_value(&params).unwrap(),
            now,
        )
        .unwrap();

    let decoded: FetchParams = task.payload_as().unwrap();
    assert_eq!(decoded, params);

    let bad = catalog
        .new_task(HANDLER_FETCH_OBSERVATIONS, json!({"run_id": 7}), now)
        .unwrap();
    assert!(matches!(
        bad.payload_as::<FetchParams>(),
        Err(SchedulerError::InvalidTaskParams(_))
    ));
}
