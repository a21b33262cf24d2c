use std::sync::Arc;
use std::time::Duration;

use snowcast_core::{
    config::{HandlersConfig, SimulationConfig},
    models::{HandlerOutcome, PipelineRunParams, PipelineStage, Task},
    Clock, ManualClock, ObservationRepository, PipelineRunRepository, RunWorkspace,
    SchedulerError, SimulationResultRepository, StationRepository, TaskBroker, TaskCatalog,
    TaskContext, TaskHandler, HANDLER_CLEANUP, HANDLER_FETCH_OBSERVATIONS, HANDLER_PIPELINE_RUN,
    HANDLER_SIMULATION_BATCH, HANDLER_STORE_RESULTS,
};
use snowcast_dispatcher::{CoordinatorSettings, PipelineCoordinator};
use snowcast_infrastructure::{CleanupService, InMemoryStore, InMemoryTaskBroker};
use snowcast_testing_utils::{
    active_stations, morning_of_first_day, FakeLauncher, FakeObservationSource, FetchScript,
    TaskBuilder,
};
use snowcast_worker::{
    CleanupHandler, FetchObservationsHandler, PipelineRunHandler, SimulationBatchHandler,
    SimulationRunner, StoreResultsHandler,
};
use tempfile::TempDir;
use tokio::sync::watch;
use uuid::Uuid;

struct Fixture {
    dir: TempDir,
    store: Arc<InMemoryStore>,
    broker: Arc<InMemoryTaskBroker>,
    catalog: Arc<TaskCatalog>,
    clock: Arc<ManualClock>,
    workspace: RunWorkspace,
    coordinator: Arc<PipelineCoordinator>,
}

async fn fixture(stations: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    for station in active_stations(stations) {
        store.upsert(&station).await.unwrap();
    }
    let broker = Arc::new(
        InMemoryTaskBroker::new(
            [("data_fetch", 4), ("modeling", 2), ("pipeline", 2)],
            Duration::from_secs(3600),
        )
        .unwrap(),
    );
    let catalog = Arc::new(TaskCatalog::standard(&HandlersConfig::default()).unwrap());
    let clock = Arc::new(ManualClock::new(morning_of_first_day()));
    let workspace = RunWorkspace::new(dir.path().join("runs"), dir.path().join("results"));
    let coordinator = Arc::new(PipelineCoordinator::new(
        store.clone(),
        store.clone(),
        broker.clone(),
        catalog.clone(),
        workspace.clone(),
        clock.clone(),
        CoordinatorSettings::default(),
    ));
    Fixture {
        dir,
        store,
        broker,
        catalog,
        clock,
        workspace,
        coordinator,
    }
}

fn ctx(task: Task) -> TaskContext {
    let (_tx, rx) = watch::channel(false);
    TaskContext::new(task, "test-worker", Duration::from_secs(60), rx)
}

async fn dequeue(f: &Fixture, queue: &str, handler: &str) -> Task {
    let task = f.broker.dequeue(queue).await.unwrap().unwrap();
    assert_eq!(task.handler_name, handler);
    f.broker.ack(task.id).await.unwrap();
    task
}

impl Fixture {
    fn fetch_handler(&self, source: FakeObservationSource) -> FetchObservationsHandler {
        FetchObservationsHandler::new(
            Arc::new(source),
            self.store.clone(),
            self.coordinator.clone(),
        )
    }

    fn simulation_handler(&self, launcher: FakeLauncher) -> SimulationBatchHandler {
        let config_dir = self.dir.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        for name in ["st01", "st02"] {
            std::fs::write(config_dir.join(format!("{name}.ini")), "[General]").unwrap();
        }
        let runner = SimulationRunner::new(
            Arc::new(launcher),
            self.workspace.clone(),
            &SimulationConfig {
                config_dir,
                ..SimulationConfig::default()
            },
        );
        SimulationBatchHandler::new(Arc::new(runner), self.coordinator.clone())
    }

    fn store_handler(&self) -> StoreResultsHandler {
        StoreResultsHandler::new(
            self.store.clone(),
            self.store.clone(),
            self.coordinator.clone(),
            self.clock.clone(),
        )
    }

    async fn start_run(&self) -> Uuid {
        let run_id = Uuid::new_v4();
        let task = self
            .catalog
            .new_task(
                HANDLER_PIPELINE_RUN,
                serde_json::to_value(PipelineRunParams {
                    run_id,
                    trigger_label: "morning_run".to_string(),
                })
                .unwrap(),
                self.clock.now(),
            )
            .unwrap();
        let outcome = PipelineRunHandler::new(self.coordinator.clone())
            .handle(ctx(task))
            .await;
        assert!(outcome.is_success());
        run_id
    }
}

#[tokio::test]
async fn test_pipeline_run_handler_enqueues_fetch() {
    let f = fixture(2).await;
    let run_id = f.start_run().await;

    let fetch = dequeue(&f, "data_fetch", HANDLER_FETCH_OBSERVATIONS).await;
    assert_eq!(fetch.pipeline_run_id, Some(run_id));
    let run = f.coordinator.run_status(run_id).await.unwrap();
    assert_eq!(run.stage, PipelineStage::Fetching);
}

#[tokio::test]
async fn test_fetch_redelivery_does_not_duplicate_rows() {
    let f = fixture(2).await;
    let run_id = f.start_run().await;
    let fetch = dequeue(&f, "data_fetch", HANDLER_FETCH_OBSERVATIONS).await;
    let handler = f.fetch_handler(FakeObservationSource::with_records(3));

    assert!(handler.handle(ctx(fetch.clone())).await.is_success());
    assert_eq!(f.store.count_records(None).await.unwrap(), 6);

    // 至少一次投递：同一任务再执行一次
    assert!(handler.handle(ctx(fetch)).await.is_success());
    assert_eq!(f.store.count_records(None).await.unwrap(), 6);

    let run = f.coordinator.run_status(run_id).await.unwrap();
    assert_eq!(run.stage, PipelineStage::Simulating);
    assert_eq!(f.broker.queue_stats("modeling").await.unwrap().ready, 1);
}

#[tokio::test]
async fn test_fetch_errors_are_classified() {
    let f = fixture(1).await;
    f.start_run().await;
    let fetch = dequeue(&f, "data_fetch", HANDLER_FETCH_OBSERVATIONS).await;

    let transient = f.fetch_handler(FakeObservationSource::new([FetchScript::Transient(
        "connection reset".into(),
    )]));
    assert!(matches!(
        transient.handle(ctx(fetch.clone())).await,
        HandlerOutcome::Retryable {
            error: SchedulerError::TransientFetch(_),
            ..
        }
    ));

    let failure = f.fetch_handler(FakeObservationSource::new([FetchScript::Failure(
        "RESPONSE_CODE 2".into(),
    )]));
    assert!(matches!(
        failure.handle(ctx(fetch.clone())).await,
        HandlerOutcome::Retryable {
            error: SchedulerError::FetchFailure(_),
            ..
        }
    ));

    let empty = f.fetch_handler(FakeObservationSource::with_records(0));
    assert!(matches!(
        empty.handle(ctx(fetch.clone())).await,
        HandlerOutcome::Fatal(SchedulerError::NoObservationData(_))
    ));

    let empty_retry = f
        .fetch_handler(FakeObservationSource::with_records(0))
        .retry_on_empty_fetch(true);
    assert!(matches!(
        empty_retry.handle(ctx(fetch)).await,
        HandlerOutcome::Retryable {
            error: SchedulerError::NoObservationData(_),
            ..
        }
    ));

    let bad_payload = TaskBuilder::new(HANDLER_FETCH_OBSERVATIONS)
        .with_payload(serde_json::json!({"run_id": "nope"}))
        .build();
    assert!(matches!(
        empty_retry.handle(ctx(bad_payload)).await,
        HandlerOutcome::Fatal(SchedulerError::InvalidTaskParams(_))
    ));
}

#[tokio::test]
async fn test_full_run_through_handlers() {
    let f = fixture(2).await;
    let run_id = f.start_run().await;

    let fetch = dequeue(&f, "data_fetch", HANDLER_FETCH_OBSERVATIONS).await;
    let outcome = f
        .fetch_handler(FakeObservationSource::with_records(4))
        .handle(ctx(fetch))
        .await;
    assert!(outcome.is_success());

    let simulation = dequeue(&f, "modeling", HANDLER_SIMULATION_BATCH).await;
    let outcome = f
        .simulation_handler(FakeLauncher::new())
        .handle(ctx(simulation))
        .await;
    assert!(outcome.is_success());

    let store = dequeue(&f, "pipeline", HANDLER_STORE_RESULTS).await;
    let handler = f.store_handler();
    assert!(handler.handle(ctx(store.clone())).await.is_success());
    // 重复入库覆盖而不是追加
    assert!(handler.handle(ctx(store)).await.is_success());

    let results = f.store.results_for_run(run_id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].output_files, vec!["st01.pro"]);
    assert_ne!(results[0].output_path, results[1].output_path);

    let station = f.store.get_by_external_id("ST01").await.unwrap().unwrap();
    assert_eq!(station.last_fetch_time, Some(morning_of_first_day()));

    let run = f.store.get(run_id).await.unwrap().unwrap();
    assert_eq!(run.stage, PipelineStage::Completed);
}

#[tokio::test]
async fn test_simulation_failure_fails_run_under_all_succeed() {
    let f = fixture(2).await;
    let run_id = f.start_run().await;
    let fetch = dequeue(&f, "data_fetch", HANDLER_FETCH_OBSERVATIONS).await;
    f.fetch_handler(FakeObservationSource::with_records(2))
        .handle(ctx(fetch))
        .await;

    let simulation = dequeue(&f, "modeling", HANDLER_SIMULATION_BATCH).await;
    let outcome = f
        .simulation_handler(FakeLauncher::new().with_exit_code("st02", 1))
        .handle(ctx(simulation))
        .await;
    match outcome {
        HandlerOutcome::Fatal(SchedulerError::SimulationProcess {
            config_identifier,
            exit_code,
            ..
        }) => {
            assert_eq!(config_identifier, "st02");
            assert_eq!(exit_code, Some(1));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let run = f.coordinator.run_status(run_id).await.unwrap();
    assert_eq!(run.stage, PipelineStage::Failed);
    assert_eq!(run.failed_stage(), Some(PipelineStage::Simulating));
    assert_eq!(f.broker.queue_stats("pipeline").await.unwrap().ready, 0);
}

#[tokio::test]
async fn test_simulation_soft_limit_returns_retryable_timeout() {
    let f = fixture(2).await;
    let run_id = f.start_run().await;
    let fetch = dequeue(&f, "data_fetch", HANDLER_FETCH_OBSERVATIONS).await;
    f.fetch_handler(FakeObservationSource::with_records(2))
        .handle(ctx(fetch))
        .await;

    let simulation = dequeue(&f, "modeling", HANDLER_SIMULATION_BATCH).await;
    let handler =
        f.simulation_handler(FakeLauncher::new().with_delay(Duration::from_secs(30)));
    let (soft_tx, soft_rx) = watch::channel(false);
    let context = TaskContext::new(
        simulation,
        "test-worker",
        Duration::from_millis(50),
        soft_rx,
    );
    let execution = tokio::spawn(async move { handler.handle(context).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    soft_tx.send(true).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), execution)
        .await
        .unwrap()
        .unwrap();
    match outcome {
        HandlerOutcome::Retryable {
            error: SchedulerError::SoftTimeout { limit },
            ..
        } => assert_eq!(limit, Duration::from_millis(50)),
        other => panic!("unexpected outcome: {other:?}"),
    }

    // 部分结果不入库，运行仍停留在模拟阶段等待重试
    let run = f.coordinator.run_status(run_id).await.unwrap();
    assert_eq!(run.stage, PipelineStage::Simulating);
    assert_eq!(f.broker.queue_stats("pipeline").await.unwrap().ready, 0);
}

#[tokio::test]
async fn test_cleanup_handler_reports_counts() {
    let f = fixture(1).await;
    let service = Arc::new(CleanupService::new(
        f.store.clone(),
        f.store.clone(),
        f.clock.clone(),
        30,
    ));
    let handler = CleanupHandler::new(service);

    let task = TaskBuilder::new(HANDLER_CLEANUP)
        .with_payload(serde_json::json!({}))
        .build();
    match handler.handle(ctx(task)).await {
        HandlerOutcome::Success(stats) => assert_eq!(stats["total_deleted"], 0),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let invalid = TaskBuilder::new(HANDLER_CLEANUP)
        .with_payload(serde_json::json!({ "retention_days": 0 }))
        .build();
    assert!(matches!(
        handler.handle(ctx(invalid)).await,
        HandlerOutcome::Fatal(SchedulerError::InvalidTaskParams(_))
    ));
}
