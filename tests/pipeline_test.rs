//! 全链路测试：触发调度器入队，worker 池执行五个处理器，协调器推进运行阶段

use std::sync::Arc;
use std::time::Duration;

use snowcast_core::{
    config::{HandlersConfig, SimulationConfig},
    models::{PipelineRun, PipelineStage},
    ManualClock, ObservationRepository, PipelineRunRepository, RunWorkspace,
    SimulationResultRepository, StationRepository, TaskBroker, TaskCatalog, TaskHandler,
};
use snowcast_dispatcher::{
    CoordinatorSettings, PipelineCoordinator, TriggerScheduler, CLEANUP_TRIGGER,
    MORNING_RUN_LABEL,
};
use snowcast_infrastructure::{CleanupService, InMemoryStore, InMemoryTaskBroker};
use snowcast_testing_utils::{
    active_stations, morning_of_first_day, FakeLauncher, FakeObservationSource, FetchScript,
    TestEnv,
};
use snowcast_worker::{
    CleanupHandler, FetchObservationsHandler, HandlerRegistry, PipelineRunHandler,
    SimulationBatchHandler, SimulationRunner, StoreResultsHandler, WorkerPoolBuilder,
};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

fn fast_handlers() -> HandlersConfig {
    HandlersConfig {
        default_rate_limit_per_minute: 60_000,
        default_soft_time_limit_seconds: 5,
        default_hard_time_limit_seconds: 10,
        default_max_attempts: 2,
        default_base_delay_seconds: 0,
        annotations: Vec::new(),
    }
}

struct System {
    _dir: TempDir,
    store: Arc<InMemoryStore>,
    broker: Arc<InMemoryTaskBroker>,
    clock: Arc<ManualClock>,
    scheduler: TriggerScheduler,
    shutdown_tx: broadcast::Sender<()>,
    pool_handle: JoinHandle<()>,
}

async fn start_system(source: FakeObservationSource, launcher: FakeLauncher) -> System {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    for name in ["st01", "st02"] {
        std::fs::write(config_dir.join(format!("{name}.ini")), "[General]").unwrap();
    }

    let store = Arc::new(InMemoryStore::new());
    for station in active_stations(2) {
        store.upsert(&station).await.unwrap();
    }
    let broker = Arc::new(
        InMemoryTaskBroker::new(
            [("data_fetch", 2), ("modeling", 1), ("pipeline", 2)],
            Duration::from_secs(3600),
        )
        .unwrap(),
    );
    let catalog = Arc::new(TaskCatalog::standard(&fast_handlers()).unwrap());
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
    let scheduler = TriggerScheduler::new(
        Vec::new(),
        broker.clone(),
        catalog.clone(),
        clock.clone(),
        Duration::from_secs(60),
    )
    .unwrap();

    let runner = SimulationRunner::new(
        Arc::new(launcher),
        workspace,
        &SimulationConfig {
            config_dir,
            ..SimulationConfig::default()
        },
    );
    let cleanup = CleanupService::new(store.clone(), store.clone(), clock.clone(), 30);
    let handlers: Vec<Arc<dyn TaskHandler>> = vec![
        Arc::new(PipelineRunHandler::new(coordinator.clone())),
        Arc::new(FetchObservationsHandler::new(
            Arc::new(source),
            store.clone(),
            coordinator.clone(),
        )),
        Arc::new(SimulationBatchHandler::new(
            Arc::new(runner),
            coordinator.clone(),
        )),
        Arc::new(StoreResultsHandler::new(
            store.clone(),
            store.clone(),
            coordinator.clone(),
            clock.clone(),
        )),
        Arc::new(CleanupHandler::new(Arc::new(cleanup))),
    ];
    let registry = Arc::new(HandlerRegistry::new(catalog, handlers).unwrap());

    let pool = WorkerPoolBuilder::new(broker.clone(), registry)
        .worker_id("e2e-worker")
        .queue_slots("data_fetch", 2)
        .queue_slots("modeling", 1)
        .queue_slots("pipeline", 2)
        .poll_interval(Duration::from_millis(10))
        .shutdown_grace(Duration::from_secs(5))
        .failure_listener(coordinator.clone())
        .build()
        .unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let pool_handle = tokio::spawn(async move { pool.run(shutdown_rx).await });

    System {
        _dir: dir,
        store,
        broker,
        clock,
        scheduler,
        shutdown_tx,
        pool_handle,
    }
}

impl System {
    async fn trigger_run(&self, label: &str) -> Uuid {
        let task = self.scheduler.trigger_now(label).await.unwrap();
        task.pipeline_run_id.unwrap()
    }

    async fn wait_terminal(&self, run_id: Uuid) -> PipelineRun {
        TestEnv::wait_for_terminal_run(self.store.as_ref(), run_id, Duration::from_secs(10))
            .await
            .unwrap_or_else(|| panic!("run {run_id} did not reach a terminal stage"))
    }

    async fn wait_idle(&self) {
        assert!(
            TestEnv::wait_for_idle(
                self.broker.as_ref(),
                &["data_fetch", "modeling", "pipeline"],
                Duration::from_secs(10),
            )
            .await,
            "queues did not drain"
        );
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        tokio::time::timeout(Duration::from_secs(10), self.pool_handle)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_concurrent_triggers_produce_distinct_completed_runs() {
    let system = start_system(FakeObservationSource::with_records(3), FakeLauncher::new()).await;

    let first = system.trigger_run(MORNING_RUN_LABEL).await;
    let second = system.trigger_run(MORNING_RUN_LABEL).await;
    assert_ne!(first, second);

    for run_id in [first, second] {
        let run = system.wait_terminal(run_id).await;
        assert_eq!(run.stage, PipelineStage::Completed);
        assert_eq!(run.trigger_label, MORNING_RUN_LABEL);

        let results = system.store.results_for_run(run_id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.output_path.to_string_lossy().contains(&run_id.to_string())));
    }

    system.wait_idle().await;
    assert!(system.broker.failed_tasks(None).await.unwrap().is_empty());
    system.stop().await;
}

#[tokio::test]
async fn test_exhausted_fetch_fails_run_without_simulating() {
    let launcher = FakeLauncher::new();
    let system = start_system(
        FakeObservationSource::new([FetchScript::Failure("RESPONSE_CODE 2".into())]),
        launcher,
    )
    .await;

    let run_id = system.trigger_run(MORNING_RUN_LABEL).await;
    let run = system.wait_terminal(run_id).await;
    assert_eq!(run.stage, PipelineStage::Failed);
    assert_eq!(run.failed_stage(), Some(PipelineStage::Fetching));

    system.wait_idle().await;
    let failed = system.broker.failed_tasks(Some("data_fetch")).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempt_count, 2);
    assert!(system.store.results_for_run(run_id).await.unwrap().is_empty());
    system.stop().await;
}

#[tokio::test]
async fn test_cleanup_after_retention_is_idempotent() {
    let system = start_system(FakeObservationSource::with_records(2), FakeLauncher::new()).await;

    let run_id = system.trigger_run(MORNING_RUN_LABEL).await;
    assert_eq!(
        system.wait_terminal(run_id).await.stage,
        PipelineStage::Completed
    );
    system.wait_idle().await;
    assert!(system.store.count_records(None).await.unwrap() > 0);
    assert_eq!(system.store.count_results().await.unwrap(), 2);

    // 保留期内清理不删除任何数据
    system.scheduler.trigger_now(CLEANUP_TRIGGER).await.unwrap();
    system.wait_idle().await;
    assert_eq!(system.store.count_results().await.unwrap(), 2);

    system.clock.advance(chrono::Duration::days(40));
    for _ in 0..2 {
        system.scheduler.trigger_now(CLEANUP_TRIGGER).await.unwrap();
        system.wait_idle().await;
        assert_eq!(system.store.count_records(None).await.unwrap(), 0);
        assert_eq!(system.store.count_results().await.unwrap(), 0);
    }

    // 运行记录本身不受清理影响
    assert!(system.store.get(run_id).await.unwrap().is_some());
    assert!(system.broker.failed_tasks(None).await.unwrap().is_empty());
    system.stop().await;
}
