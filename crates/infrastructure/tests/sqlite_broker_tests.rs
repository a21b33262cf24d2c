use chrono::{Duration, TimeZone, Utc};
use snowcast_core::{
    config::DatabaseConfig,
    models::{Task, TaskStatus},
    Clock, ManualClock, SchedulerError, TaskBroker,
};
use snowcast_infrastructure::{DatabaseManager, SqliteTaskBroker};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

/// 在临时目录中创建数据库并建表
async fn setup_database() -> (TempDir, DatabaseManager) {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("broker.db").display()),
        ..DatabaseConfig::default()
    };
    let manager = DatabaseManager::new(&config).await.unwrap();
    manager.migrate().await.unwrap();
    (dir, manager)
}

fn limits() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("data_fetch".to_string(), 1),
        ("modeling".to_string(), 1),
    ])
}

fn fetch_task(max_attempts: u32, now: chrono::DateTime<Utc>) -> Task {
    Task::new(
        "data_fetch",
        "fetch.observations",
        serde_json::json!({"station_ids": ["WBB"]}),
        max_attempts,
        now,
    )
}

#[tokio::test]
async fn test_sqlite_broker_fifo_and_concurrency_limit() {
    let (_dir, db) = setup_database().await;
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 4, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(now));
    let broker = SqliteTaskBroker::with_clock(
        db.pool().clone(),
        limits(),
        std::time::Duration::from_secs(3600),
        clock.clone(),
    )
    .unwrap();

    let first = fetch_task(3, now);
    let second = fetch_task(3, now);
    broker.enqueue(first.clone(), "data_fetch", now).await.unwrap();
    clock.advance(Duration::milliseconds(1));
    broker
        .enqueue(second.clone(), "data_fetch", now + Duration::milliseconds(1))
        .await
        .unwrap();

    let got = broker.dequeue("data_fetch").await.unwrap().unwrap();
    assert_eq!(got.id, first.id);
    assert_eq!(got.status, TaskStatus::Running);

    // 并发上限为1，第二个任务必须等第一个确认
    assert!(broker.dequeue("data_fetch").await.unwrap().is_none());

    // 另一个队列不受影响
    let modeling = Task::new("modeling", "simulation.run_batch", serde_json::json!({}), 1, now);
    broker.enqueue(modeling.clone(), "modeling", now).await.unwrap();
    assert_eq!(
        broker.dequeue("modeling").await.unwrap().unwrap().id,
        modeling.id
    );

    broker.ack(first.id).await.unwrap();
    assert_eq!(
        broker.dequeue("data_fetch").await.unwrap().unwrap().id,
        second.id
    );
}

#[tokio::test]
async fn test_sqlite_broker_nack_until_retry_limit() {
    let (_dir, db) = setup_database().await;
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 4, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(now));
    let broker = SqliteTaskBroker::with_clock(
        db.pool().clone(),
        limits(),
        std::time::Duration::from_secs(3600),
        clock.clone(),
    )
    .unwrap();

    let task = fetch_task(2, now);
    broker.enqueue(task.clone(), "data_fetch", now).await.unwrap();

    for (attempt, delay) in [(1, 60), (2, 120)] {
        let got = broker.dequeue("data_fetch").await.unwrap().unwrap();
        let retried = broker
            .nack(got.id, std::time::Duration::from_secs(delay))
            .await
            .unwrap();
        assert_eq!(retried.attempt_count, attempt);
        assert_eq!(retried.eta, clock.now() + Duration::seconds(delay as i64));

        // ETA 之前不可出队
        assert!(broker.dequeue("data_fetch").await.unwrap().is_none());
        clock.advance(Duration::seconds(delay as i64));
    }

    let got = broker.dequeue("data_fetch").await.unwrap().unwrap();
    let err = broker
        .nack(got.id, std::time::Duration::from_secs(240))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::RetryLimitExceeded { .. }));

    let failed = broker.fail(got.id, "exhausted").await.unwrap();
    assert_eq!(failed.status, TaskStatus::FailedPermanent);
    assert_eq!(failed.attempt_count, 2);

    let dead = broker.failed_tasks(Some("data_fetch")).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].last_error.as_deref(), Some("exhausted"));
    assert!(broker.failed_tasks(Some("modeling")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sqlite_broker_redelivers_after_visibility_timeout() {
    let (_dir, db) = setup_database().await;
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 4, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(now));
    let broker = SqliteTaskBroker::with_clock(
        db.pool().clone(),
        limits(),
        std::time::Duration::from_secs(60),
        clock.clone(),
    )
    .unwrap();

    let task = fetch_task(3, now);
    broker.enqueue(task.clone(), "data_fetch", now).await.unwrap();
    broker.dequeue("data_fetch").await.unwrap().unwrap();

    clock.advance(Duration::seconds(61));
    let redelivered = broker.dequeue("data_fetch").await.unwrap().unwrap();
    assert_eq!(redelivered.id, task.id);
    assert_eq!(redelivered.attempt_count, 0);

    let stats = broker.queue_stats("data_fetch").await.unwrap();
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.concurrency_limit, 1);
}

#[tokio::test]
async fn test_sqlite_broker_survives_reopen() {
    let (dir, db) = setup_database().await;
    let now = Utc::now();
    let task = fetch_task(3, now);
    {
        let broker = SqliteTaskBroker::new(
            db.pool().clone(),
            limits(),
            std::time::Duration::from_secs(3600),
        )
        .unwrap();
        broker.enqueue(task.clone(), "data_fetch", now).await.unwrap();
    }
    db.close().await;

    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("broker.db").display()),
        ..DatabaseConfig::default()
    };
    let reopened = DatabaseManager::new(&config).await.unwrap();
    let broker = SqliteTaskBroker::new(
        reopened.pool().clone(),
        limits(),
        std::time::Duration::from_secs(3600),
    )
    .unwrap();
    let got = broker.dequeue("data_fetch").await.unwrap().unwrap();
    assert_eq!(got.id, task.id);
    assert_eq!(got.payload, task.payload);
}

#[tokio::test]
async fn test_sqlite_broker_rejects_unknown_queue() {
    let (_dir, db) = setup_database().await;
    let broker = SqliteTaskBroker::new(
        db.pool().clone(),
        limits(),
        std::time::Duration::from_secs(3600),
    )
    .unwrap();
    assert!(matches!(
        broker.dequeue("reports").await,
        Err(SchedulerError::MessageQueue(_))
    ));
}
