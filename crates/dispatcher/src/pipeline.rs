use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use snowcast_core::{
    models::{
        FetchParams, ObservationBatch, PipelineRun, PipelineRunQuery, PipelineStage,
        RunSuccessPolicy, SimulationBatchParams, SimulationBatchReport, StoreResultsParams, Task,
        TimeRange,
    },
    AppConfig, Clock, PipelineProgress, PipelineRunRepository, RunWorkspace, SchedulerError,
    SchedulerResult, StationRepository, TaskBroker, TaskCatalog, TaskFailureListener,
    HANDLER_FETCH_OBSERVATIONS, HANDLER_PIPELINE_RUN, HANDLER_SIMULATION_BATCH,
    HANDLER_STORE_RESULTS,
};

/// 并发修改时重新读取并重放失败转换的次数
const FAIL_RETRIES: usize = 3;

/// 协调器需要的配置项
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub fetch_window: Duration,
    pub success_policy: RunSuccessPolicy,
    pub historical_data_dir: Option<PathBuf>,
}

impl CoordinatorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            fetch_window: Duration::hours(i64::from(config.pipeline.fetch_window_hours)),
            success_policy: config.pipeline.success_policy,
            historical_data_dir: config.simulation.historical_data_dir.clone(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            fetch_window: Duration::hours(24),
            success_policy: RunSuccessPolicy::AllSucceed,
            historical_data_dir: None,
        }
    }
}

/// 采集阶段结束时记录在阶段摘要中的信息，入库阶段会用到
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FetchSummary {
    station_ids: Vec<String>,
    time_range: TimeRange,
    records: usize,
    historical_files: usize,
}

/// 流水线协调器
///
/// 维护每个运行的状态机 `fetching → simulating → storing → completed`，
/// 任一阶段都可以进入 `failed` 终态。下一阶段的任务总是先入队、再写入阶段转换：
/// 写入失败时任务会重复执行，但重复的上报对已越过的阶段没有效果。
pub struct PipelineCoordinator {
    runs: Arc<dyn PipelineRunRepository>,
    stations: Arc<dyn StationRepository>,
    broker: Arc<dyn TaskBroker>,
    catalog: Arc<TaskCatalog>,
    workspace: RunWorkspace,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
}

impl PipelineCoordinator {
    pub fn new(
        runs: Arc<dyn PipelineRunRepository>,
        stations: Arc<dyn StationRepository>,
        broker: Arc<dyn TaskBroker>,
        catalog: Arc<TaskCatalog>,
        workspace: RunWorkspace,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            runs,
            stations,
            broker,
            catalog,
            workspace,
            clock,
            settings,
        }
    }

    /// 查询单个运行的当前状态
    pub async fn run_status(&self, run_id: Uuid) -> SchedulerResult<PipelineRun> {
        self.load(run_id).await
    }

    /// 按标签和时间范围查询运行记录，按创建时间倒序
    pub async fn query_runs(&self, query: &PipelineRunQuery) -> SchedulerResult<Vec<PipelineRun>> {
        self.runs.query(query).await
    }

    async fn load(&self, run_id: Uuid) -> SchedulerResult<PipelineRun> {
        self.runs
            .get(run_id)
            .await?
            .ok_or(SchedulerError::PipelineRunNotFound { id: run_id })
    }

    /// 把运行标记为失败
    ///
    /// `owner` 为失败任务所属的阶段；运行已经离开该阶段时，
    /// 说明这是重复投递的旧任务，失败被忽略。
    #[instrument(skip(self, error), fields(run_id = %run_id))]
    async fn fail_run_at(
        &self,
        run_id: Uuid,
        error: &str,
        owner: Option<PipelineStage>,
    ) -> SchedulerResult<PipelineRun> {
        for _ in 0..FAIL_RETRIES {
            let mut run = self.load(run_id).await?;
            if run.stage == PipelineStage::Completed {
                warn!("Run {} already completed, ignoring failure: {}", run_id, error);
                return Ok(run);
            }
            if let Some(owner) = owner {
                if !run.stage.is_terminal() && run.stage != owner {
                    warn!(
                        "Run {} moved from {} to {}, ignoring stale failure: {}",
                        run_id, owner, run.stage, error
                    );
                    return Ok(run);
                }
            }

            let expected = run.stage;
            if !run.fail(error, serde_json::Value::Null, self.clock.now())? {
                return Ok(run);
            }

            if self.runs.update(&run, expected).await? {
                error!("Pipeline run {} failed at {}: {}", run_id, expected, error);
                counter!("snowcast_pipeline_runs_finished_total", "stage" => run.stage.as_str())
                    .increment(1);
                return Ok(run);
            }
        }

        Err(SchedulerError::Storage(format!(
            "运行 {run_id} 在并发修改下无法标记为失败"
        )))
    }

    async fn enqueue_stage_task(
        &self,
        handler_name: &str,
        payload: serde_json::Value,
        run_id: Uuid,
    ) -> SchedulerResult<Task> {
        let task = self
            .catalog
            .new_task(handler_name, payload, self.clock.now())?
            .with_pipeline_run(run_id);
        self.broker
            .enqueue(task.clone(), &task.queue_name, task.eta)
            .await?;
        debug!("Run {} enqueued {} as task {}", run_id, handler_name, task.id);
        Ok(task)
    }

    /// 以 `expected` 为条件写入，写入失败说明其他执行者已经推进了这个运行
    async fn commit(&self, run: PipelineRun, expected: PipelineStage) -> SchedulerResult<PipelineRun> {
        if self.runs.update(&run, expected).await? {
            if run.is_terminal() {
                counter!("snowcast_pipeline_runs_finished_total", "stage" => run.stage.as_str())
                    .increment(1);
            }
            Ok(run)
        } else {
            warn!(
                "Run {} moved away from {} concurrently, keeping stored state",
                run.id, expected
            );
            self.load(run.id).await
        }
    }

    fn fetch_summary(run: &PipelineRun) -> SchedulerResult<FetchSummary> {
        let detail = run
            .summary(PipelineStage::Fetching)
            .map(|s| s.detail.clone())
            .unwrap_or_default();
        serde_json::from_value(detail).map_err(|e| {
            SchedulerError::Internal(format!("运行 {} 缺少采集阶段摘要: {e}", run.id))
        })
    }
}

#[async_trait]
impl PipelineProgress for PipelineCoordinator {
    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn start_run(&self, run_id: Uuid, trigger_label: &str) -> SchedulerResult<PipelineRun> {
        let now = self.clock.now();
        let fresh = PipelineRun::new(run_id, trigger_label, now);
        let run = if self.runs.create(&fresh).await? {
            info!("Pipeline run {} ({}) created", run_id, trigger_label);
            counter!("snowcast_pipeline_runs_started_total", "label" => trigger_label.to_string())
                .increment(1);
            fresh
        } else {
            self.load(run_id).await?
        };

        if run.stage != PipelineStage::Fetching {
            debug!("Run {} already at {}, ignoring duplicate start", run_id, run.stage);
            return Ok(run);
        }

        let stations = self.stations.list_active().await?;
        if stations.is_empty() {
            warn!("No active stations, failing run {}", run_id);
            return self.fail_run(run_id, "没有活跃的气象站").await;
        }

        let params = FetchParams {
            run_id,
            station_ids: stations
                .into_iter()
                .map(|s| s.external_identifier)
                .collect(),
            time_range: TimeRange::trailing(now, self.settings.fetch_window),
        };
        info!(
            "Run {} fetching {} station(s) for {} .. {}",
            run_id,
            params.station_ids.len(),
            params.time_range.start,
            params.time_range.end
        );
        self.enqueue_stage_task(HANDLER_FETCH_OBSERVATIONS, serde_json::to_value(&params)?, run_id)
            .await?;

        Ok(run)
    }

    #[instrument(skip(self, params, batches), fields(run_id = %params.run_id))]
    async fn record_fetch(
        &self,
        params: &FetchParams,
        batches: &[ObservationBatch],
    ) -> SchedulerResult<PipelineRun> {
        let mut run = self.load(params.run_id).await?;
        if run.stage != PipelineStage::Fetching {
            debug!("Run {} already at {}, ignoring fetch report", run.id, run.stage);
            return Ok(run);
        }

        let input_dir = self.workspace.write_batches(run.id, batches).await?;
        let historical_files = match &self.settings.historical_data_dir {
            Some(dir) if dir.exists() => self.workspace.copy_historical(run.id, dir).await?,
            Some(dir) => {
                warn!("Historical data dir {} does not exist, skipping", dir.display());
                0
            }
            None => 0,
        };

        let batch_params = SimulationBatchParams {
            run_id: run.id,
            input_dir,
            end_date: params.time_range.end.date_naive(),
        };
        self.enqueue_stage_task(
            HANDLER_SIMULATION_BATCH,
            serde_json::to_value(&batch_params)?,
            run.id,
        )
        .await?;

        let summary = FetchSummary {
            station_ids: params.station_ids.clone(),
            time_range: params.time_range,
            records: batches.iter().map(ObservationBatch::processed_count).sum(),
            historical_files,
        };
        run.advance(
            PipelineStage::Simulating,
            serde_json::to_value(&summary)?,
            self.clock.now(),
        )?;
        self.commit(run, PipelineStage::Fetching).await
    }

    #[instrument(skip(self, report), fields(run_id = %report.run_id))]
    async fn record_simulation(
        &self,
        report: &SimulationBatchReport,
    ) -> SchedulerResult<PipelineRun> {
        let mut run = self.load(report.run_id).await?;
        if run.stage != PipelineStage::Simulating {
            debug!("Run {} already at {}, ignoring simulation report", run.id, run.stage);
            return Ok(run);
        }

        let failures: Vec<_> = report
            .jobs
            .iter()
            .filter_map(|job| {
                job.error()
                    .map(|e| json!({"config": job.config_identifier, "error": e}))
            })
            .collect();
        let detail = json!({
            "total": report.total(),
            "succeeded": report.succeeded(),
            "failed": report.failed(),
            "failures": failures,
        });

        let now = self.clock.now();
        if self
            .settings
            .success_policy
            .is_satisfied(report.succeeded(), report.total())
        {
            let fetch = Self::fetch_summary(&run)?;
            let store_params = StoreResultsParams {
                run_id: run.id,
                station_ids: fetch.station_ids,
                fetched_until: fetch.time_range.end,
                jobs: report.jobs.clone(),
            };
            self.enqueue_stage_task(
                HANDLER_STORE_RESULTS,
                serde_json::to_value(&store_params)?,
                run.id,
            )
            .await?;
            info!(
                "Run {} simulations done ({}/{} succeeded), storing results",
                run.id,
                report.succeeded(),
                report.total()
            );
            run.advance(PipelineStage::Storing, detail, now)?;
        } else {
            let message = format!(
                "{}/{} 个模拟作业失败，未满足成功策略 {:?}",
                report.failed(),
                report.total(),
                self.settings.success_policy
            );
            warn!("Run {} failed: {}", run.id, message);
            run.fail(message, detail, now)?;
        }

        self.commit(run, PipelineStage::Simulating).await
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn record_store(&self, run_id: Uuid, stored: usize) -> SchedulerResult<PipelineRun> {
        let mut run = self.load(run_id).await?;
        if run.stage != PipelineStage::Storing {
            debug!("Run {} already at {}, ignoring store report", run.id, run.stage);
            return Ok(run);
        }

        run.advance(
            PipelineStage::Completed,
            json!({"stored": stored}),
            self.clock.now(),
        )?;
        let run = self.commit(run, PipelineStage::Storing).await?;
        info!("Pipeline run {} ({}) completed", run.id, run.trigger_label);
        Ok(run)
    }

    async fn fail_run(&self, run_id: Uuid, error: &str) -> SchedulerResult<PipelineRun> {
        self.fail_run_at(run_id, error, None).await
    }
}

#[async_trait]
impl TaskFailureListener for PipelineCoordinator {
    async fn on_permanent_failure(&self, task: &Task, error: &SchedulerError) {
        let Some(run_id) = task.pipeline_run_id else {
            return;
        };

        let message = format!("{} 永久失败: {}", task.handler_name, error);
        let owner = stage_owned_by(&task.handler_name);
        match self.fail_run_at(run_id, &message, owner).await {
            Ok(run) => debug!("Run {} is now {}", run.id, run.stage),
            Err(SchedulerError::PipelineRunNotFound { .. }) => {
                warn!(
                    "Task {} failed before run {} was recorded",
                    task.id, run_id
                );
            }
            Err(e) => error!("Failed to record failure of run {}: {}", run_id, e),
        }
    }
}

/// 处理器负责推进的运行阶段
fn stage_owned_by(handler_name: &str) -> Option<PipelineStage> {
    match handler_name {
        HANDLER_PIPELINE_RUN | HANDLER_FETCH_OBSERVATIONS => Some(PipelineStage::Fetching),
        HANDLER_SIMULATION_BATCH => Some(PipelineStage::Simulating),
        HANDLER_STORE_RESULTS => Some(PipelineStage::Storing),
        _ => None,
    }
}
