use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use snowcast_core::{
    config::BrokerBackend, AppConfig, Clock, ObservationRepository, PipelineRunRepository,
    RunWorkspace, SimulationResultRepository, StationRepository, SystemClock, TaskBroker,
    TaskCatalog, TaskHandler,
};
use snowcast_dispatcher::{CoordinatorSettings, PipelineCoordinator, TriggerScheduler};
use snowcast_infrastructure::{
    CleanupService, DatabaseManager, InMemoryStore, InMemoryTaskBroker, MesoWestClient,
    SqliteStore, SqliteTaskBroker,
};
use snowcast_worker::{
    CleanupHandler, DockerLauncher, FetchObservationsHandler, HandlerRegistry, PipelineRunHandler,
    SimulationBatchHandler, SimulationRunner, StoreResultsHandler, WorkerPool, WorkerPoolBuilder,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行触发调度器
    Scheduler,
    /// 仅运行 worker 池
    Worker,
    /// 同一进程内运行全部组件
    All,
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduler" => Ok(AppMode::Scheduler),
            "worker" => Ok(AppMode::Worker),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("无效的运行模式: {s}")),
        }
    }
}

/// 四个仓储接口，同一个存储实现同时满足
struct Stores {
    stations: Arc<dyn StationRepository>,
    observations: Arc<dyn ObservationRepository>,
    results: Arc<dyn SimulationResultRepository>,
    runs: Arc<dyn PipelineRunRepository>,
}

impl Stores {
    fn from_store<S>(store: Arc<S>) -> Self
    where
        S: StationRepository
            + ObservationRepository
            + SimulationResultRepository
            + PipelineRunRepository
            + 'static,
    {
        Self {
            stations: store.clone(),
            observations: store.clone(),
            results: store.clone(),
            runs: store,
        }
    }
}

/// 主应用程序，负责组装各个组件
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    database: Option<DatabaseManager>,
    broker: Arc<dyn TaskBroker>,
    stores: Stores,
    catalog: Arc<TaskCatalog>,
    clock: Arc<dyn Clock>,
    coordinator: Arc<PipelineCoordinator>,
    scheduler: Arc<TriggerScheduler>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("Initializing application in {:?} mode", mode);

        let catalog = Arc::new(
            TaskCatalog::standard(&config.handlers).context("构建任务目录失败")?,
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let visibility_timeout = Duration::from_secs(config.broker.visibility_timeout_seconds);

        let (database, broker, stores): (Option<DatabaseManager>, Arc<dyn TaskBroker>, Stores) =
            match config.broker.backend {
                BrokerBackend::Memory => {
                    if mode != AppMode::All {
                        warn!(
                            "In-memory broker is not shared between processes; \
                             {:?} mode only sees tasks it enqueues itself",
                            mode
                        );
                    }
                    let broker = InMemoryTaskBroker::new(
                        config
                            .broker
                            .concurrency
                            .iter()
                            .map(|(queue, limit)| (queue.clone(), *limit)),
                        visibility_timeout,
                    )
                    .context("创建内存队列失败")?;
                    let broker: Arc<dyn TaskBroker> = Arc::new(broker);
                    (
                        None,
                        broker,
                        Stores::from_store(Arc::new(InMemoryStore::new())),
                    )
                }
                BrokerBackend::Sqlite => {
                    let database = DatabaseManager::new(&config.database).await?;
                    database.migrate().await?;
                    let broker = SqliteTaskBroker::new(
                        database.pool().clone(),
                        config.broker.concurrency.clone(),
                        visibility_timeout,
                    )
                    .context("创建SQLite队列失败")?;
                    let broker: Arc<dyn TaskBroker> = Arc::new(broker);
                    let store = Arc::new(SqliteStore::new(database.pool().clone()));
                    (Some(database), broker, Stores::from_store(store))
                }
            };

        let workspace = RunWorkspace::new(
            config.pipeline.work_dir.clone(),
            config.simulation.results_dir.clone(),
        );
        let coordinator = Arc::new(PipelineCoordinator::new(
            stores.runs.clone(),
            stores.stations.clone(),
            broker.clone(),
            catalog.clone(),
            workspace,
            clock.clone(),
            CoordinatorSettings::from_config(&config),
        ));
        let scheduler = Arc::new(
            TriggerScheduler::from_config(
                &config.schedule,
                broker.clone(),
                catalog.clone(),
                clock.clone(),
            )
            .context("创建触发调度器失败")?,
        );

        Ok(Self {
            config,
            mode,
            database,
            broker,
            stores,
            catalog,
            clock,
            coordinator,
            scheduler,
        })
    }

    /// 手动触发一次运行或清理，入队后立即返回
    pub async fn trigger(&self, label: &str) -> Result<()> {
        let task = self
            .scheduler
            .trigger_now(label)
            .await
            .with_context(|| format!("触发 {label} 失败"))?;
        info!(
            "Enqueued {} task {} on queue {}",
            task.handler_name, task.id, task.queue_name
        );
        Ok(())
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut handles = Vec::new();

        if matches!(self.mode, AppMode::Scheduler | AppMode::All) {
            let scheduler = self.scheduler.clone();
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                scheduler.run(shutdown_rx).await;
            }));
        }

        if matches!(self.mode, AppMode::Worker | AppMode::All) {
            let pool = Arc::new(self.build_worker_pool()?);
            info!(
                "Worker {} starting with {} slot(s)",
                pool.worker_id(),
                pool.total_slots()
            );
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                pool.run(shutdown_rx).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Component task terminated abnormally: {}", e);
            }
        }

        if let Some(database) = &self.database {
            database.close().await;
        }

        info!("All components stopped");
        Ok(())
    }

    fn build_worker_pool(&self) -> Result<WorkerPool> {
        let source = Arc::new(
            MesoWestClient::new(self.config.observation_source.clone())
                .context("创建观测数据客户端失败")?,
        );
        let workspace = RunWorkspace::new(
            self.config.pipeline.work_dir.clone(),
            self.config.simulation.results_dir.clone(),
        );
        let runner = Arc::new(SimulationRunner::new(
            Arc::new(DockerLauncher::new(self.config.simulation.clone())),
            workspace,
            &self.config.simulation,
        ));
        let cleanup = Arc::new(CleanupService::new(
            self.stores.observations.clone(),
            self.stores.results.clone(),
            self.clock.clone(),
            self.config.retention.days,
        ));

        let handlers: Vec<Arc<dyn TaskHandler>> = vec![
            Arc::new(PipelineRunHandler::new(self.coordinator.clone())),
            Arc::new(
                FetchObservationsHandler::new(
                    source,
                    self.stores.observations.clone(),
                    self.coordinator.clone(),
                )
                .retry_on_empty_fetch(self.config.pipeline.retry_on_empty_fetch),
            ),
            Arc::new(SimulationBatchHandler::new(runner, self.coordinator.clone())),
            Arc::new(StoreResultsHandler::new(
                self.stores.results.clone(),
                self.stores.stations.clone(),
                self.coordinator.clone(),
                self.clock.clone(),
            )),
            Arc::new(CleanupHandler::new(cleanup)),
        ];
        let registry = Arc::new(
            HandlerRegistry::new(self.catalog.clone(), handlers).context("注册任务处理器失败")?,
        );

        WorkerPoolBuilder::from_config(&self.config, self.broker.clone(), registry)
            .failure_listener(self.coordinator.clone())
            .build()
            .context("创建worker池失败")
    }
}

/// 启动 Prometheus 指标端点
pub fn install_metrics_exporter(config: &AppConfig) -> Result<()> {
    let address: SocketAddr = config
        .observability
        .metrics_bind_address
        .parse()
        .with_context(|| {
            format!(
                "无效的指标监听地址: {}",
                config.observability.metrics_bind_address
            )
        })?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus指标导出器失败: {e}"))?;

    info!("Prometheus metrics exporter listening on {}", address);
    Ok(())
}

/// 运行开始前确保工作目录可写
pub fn ensure_directories(config: &AppConfig) -> Result<()> {
    let dirs: [&PathBuf; 2] = [&config.pipeline.work_dir, &config.simulation.results_dir];
    for dir in dirs {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("创建目录失败: {}", dir.display()))?;
    }
    Ok(())
}
