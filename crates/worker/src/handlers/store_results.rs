use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use snowcast_core::{
    models::{HandlerOutcome, SimulationResultRecord, StoreResultsParams},
    Clock, PipelineProgress, SchedulerResult, SimulationResultRepository, StationRepository,
    TaskContext, TaskHandler, HANDLER_STORE_RESULTS,
};

/// `pipeline.store_results`：登记成功作业的输出并推进站点的最后采集时间
pub struct StoreResultsHandler {
    results: Arc<dyn SimulationResultRepository>,
    stations: Arc<dyn StationRepository>,
    progress: Arc<dyn PipelineProgress>,
    clock: Arc<dyn Clock>,
}

impl StoreResultsHandler {
    pub fn new(
        results: Arc<dyn SimulationResultRepository>,
        stations: Arc<dyn StationRepository>,
        progress: Arc<dyn PipelineProgress>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            results,
            stations,
            progress,
            clock,
        }
    }

    async fn execute(&self, ctx: &TaskContext) -> SchedulerResult<serde_json::Value> {
        let params: StoreResultsParams = ctx.task.payload_as()?;
        let now = self.clock.now();

        let mut stored = 0;
        for job in params.jobs.iter().filter(|job| job.is_succeeded()) {
            let record = SimulationResultRecord {
                run_id: params.run_id,
                config_identifier: job.config_identifier.clone(),
                output_path: job.output_path.clone(),
                output_files: list_output_files(&job.output_path).await?,
                exit_code: job.exit_code,
                duration_ms: job.duration_ms,
                created_at: now,
            };
            self.results.upsert_result(&record).await?;
            stored += 1;
        }

        let updated = self
            .stations
            .update_last_fetch_time(&params.station_ids, params.fetched_until)
            .await?;
        info!(
            "Stored {} simulation result(s), advanced last fetch time of {} station(s) to {}",
            stored, updated, params.fetched_until
        );

        let run = self.progress.record_store(params.run_id, stored).await?;
        Ok(json!({
            "run_id": run.id,
            "stage": run.stage.as_str(),
            "stored": stored,
            "stations_updated": updated,
        }))
    }
}

#[async_trait]
impl TaskHandler for StoreResultsHandler {
    fn name(&self) -> &str {
        HANDLER_STORE_RESULTS
    }

    async fn handle(&self, ctx: TaskContext) -> HandlerOutcome {
        HandlerOutcome::from_result(self.execute(&ctx).await)
    }
}

/// 输出目录中的文件名，按名称排序
async fn list_output_files(dir: &Path) -> SchedulerResult<Vec<String>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}
