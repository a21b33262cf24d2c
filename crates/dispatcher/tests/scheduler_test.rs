use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use snowcast_core::{
    config::{HandlersConfig, ScheduleConfig},
    models::{PipelineRunParams, Task},
    ManualClock, QueueStats, SchedulerError, SchedulerResult, TaskBroker, TaskCatalog,
    HANDLER_CLEANUP, HANDLER_PIPELINE_RUN,
};
use snowcast_dispatcher::{TriggerScheduler, MORNING_RUN_LABEL};
use snowcast_infrastructure::InMemoryTaskBroker;
use tokio::sync::Mutex;
use uuid::Uuid;

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, hour, minute, second).unwrap()
}

fn setup(broker: Arc<dyn TaskBroker>) -> TriggerScheduler {
    let catalog = Arc::new(TaskCatalog::standard(&HandlersConfig::default()).unwrap());
    TriggerScheduler::from_config(
        &ScheduleConfig::default(),
        broker,
        catalog,
        Arc::new(ManualClock::new(at(0, 0, 0))),
    )
    .unwrap()
}

fn memory_broker() -> Arc<InMemoryTaskBroker> {
    Arc::new(
        InMemoryTaskBroker::new(
            [("data_fetch", 4), ("modeling", 2), ("pipeline", 2)],
            Duration::from_secs(3600),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_trigger_fires_once_per_matching_minute() {
    let broker = memory_broker();
    let scheduler = setup(broker.clone());

    let fired = scheduler.tick(at(4, 0, 5)).await;
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].handler_name, HANDLER_PIPELINE_RUN);
    let params: PipelineRunParams = fired[0].payload_as().unwrap();
    assert_eq!(params.trigger_label, MORNING_RUN_LABEL);
    assert_eq!(fired[0].pipeline_run_id, Some(params.run_id));

    // 同一分钟内的后续检查不会重复入队
    assert!(scheduler.tick(at(4, 0, 20)).await.is_empty());
    assert!(scheduler.tick(at(4, 0, 59)).await.is_empty());
    assert!(scheduler.tick(at(4, 1, 0)).await.is_empty());

    // 第二天同一时刻再次触发
    let next_day = Utc.with_ymd_and_hms(2025, 1, 2, 4, 0, 10).unwrap();
    assert_eq!(scheduler.tick(next_day).await.len(), 1);

    let stats = broker.queue_stats("pipeline").await.unwrap();
    assert_eq!(stats.ready + stats.delayed, 2);
}

#[tokio::test]
async fn test_cleanup_trigger_at_midnight() {
    let broker = memory_broker();
    let scheduler = setup(broker.clone());

    let fired = scheduler.tick(at(0, 0, 1)).await;
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].handler_name, HANDLER_CLEANUP);
    assert_eq!(fired[0].queue_name, "pipeline");
    assert!(fired[0].pipeline_run_id.is_none());
}

#[tokio::test]
async fn test_missed_window_is_not_backfilled() {
    let broker = memory_broker();
    let scheduler = setup(broker.clone());

    // 进程在 04:00 停机，05:00 才恢复
    assert!(scheduler.tick(at(5, 0, 0)).await.is_empty());
    let stats = broker.queue_stats("pipeline").await.unwrap();
    assert_eq!(stats.ready, 0);
}

#[tokio::test]
async fn test_simultaneous_firings_create_distinct_runs() {
    let broker = memory_broker();
    let scheduler = setup(broker.clone());

    let first = scheduler.trigger_now(MORNING_RUN_LABEL).await.unwrap();
    let second = scheduler.trigger_now(MORNING_RUN_LABEL).await.unwrap();

    let ids: HashSet<Uuid> = [&first, &second]
        .iter()
        .map(|t| t.payload_as::<PipelineRunParams>().unwrap().run_id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(first.id, second.id);
}

/// 前几次入队失败的队列
struct FlakyBroker {
    failures_left: Mutex<u32>,
    enqueued: Mutex<Vec<Task>>,
}

#[async_trait]
impl TaskBroker for FlakyBroker {
    async fn enqueue(&self, task: Task, _queue: &str, _eta: DateTime<Utc>) -> SchedulerResult<()> {
        let mut failures = self.failures_left.lock().await;
        if *failures > 0 {
            *failures -= 1;
            return Err(SchedulerError::MessageQueue("broker unavailable".into()));
        }
        self.enqueued.lock().await.push(task);
        Ok(())
    }

    async fn dequeue(&self, _queue: &str) -> SchedulerResult<Option<Task>> {
        Ok(None)
    }

    async fn ack(&self, task_id: Uuid) -> SchedulerResult<()> {
        Err(SchedulerError::TaskNotFound { id: task_id })
    }

    async fn nack(&self, task_id: Uuid, _retry_delay: Duration) -> SchedulerResult<Task> {
        Err(SchedulerError::TaskNotFound { id: task_id })
    }

    async fn fail(&self, task_id: Uuid, _error: &str) -> SchedulerResult<Task> {
        Err(SchedulerError::TaskNotFound { id: task_id })
    }

    async fn queue_stats(&self, queue: &str) -> SchedulerResult<QueueStats> {
        Ok(QueueStats {
            queue: queue.to_string(),
            ..QueueStats::default()
        })
    }

    async fn failed_tasks(&self, _queue: Option<&str>) -> SchedulerResult<Vec<Task>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_enqueue_failure_retried_on_next_tick() {
    let broker = Arc::new(FlakyBroker {
        failures_left: Mutex::new(1),
        enqueued: Mutex::new(Vec::new()),
    });
    let scheduler = setup(broker.clone());

    assert!(scheduler.tick(at(16, 0, 0)).await.is_empty());
    let fired = scheduler.tick(at(16, 0, 15)).await;
    assert_eq!(fired.len(), 1);
    assert!(scheduler.tick(at(16, 0, 30)).await.is_empty());
    assert_eq!(broker.enqueued.lock().await.len(), 1);
}

#[tokio::test]
async fn test_scheduler_stops_on_shutdown() {
    let broker = memory_broker();
    let scheduler = Arc::new(setup(broker));
    let (tx, rx) = tokio::sync::broadcast::channel(1);

    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run(rx).await }
    });
    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
