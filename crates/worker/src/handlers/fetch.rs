use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde_json::json;
use tracing::{info, warn};

use snowcast_core::{
    models::{FetchParams, HandlerOutcome},
    ObservationRepository, ObservationSource, PipelineProgress, SchedulerError, SchedulerResult,
    TaskContext, TaskHandler, HANDLER_FETCH_OBSERVATIONS,
};

/// `fetch.observations`：拉取一批站点的观测数据并入库
///
/// 入库按 `(站点, 时间区间)` 整体替换，重复投递不会产生重复行。
pub struct FetchObservationsHandler {
    source: Arc<dyn ObservationSource>,
    observations: Arc<dyn ObservationRepository>,
    progress: Arc<dyn PipelineProgress>,
    retry_on_empty_fetch: bool,
}

impl FetchObservationsHandler {
    pub fn new(
        source: Arc<dyn ObservationSource>,
        observations: Arc<dyn ObservationRepository>,
        progress: Arc<dyn PipelineProgress>,
    ) -> Self {
        Self {
            source,
            observations,
            progress,
            retry_on_empty_fetch: false,
        }
    }

    /// 接口成功但没有数据时是否按退避重试
    pub fn retry_on_empty_fetch(mut self, retry: bool) -> Self {
        self.retry_on_empty_fetch = retry;
        self
    }

    async fn execute(&self, params: &FetchParams) -> SchedulerResult<serde_json::Value> {
        let batches = self
            .source
            .fetch(&params.station_ids, params.time_range)
            .await?;

        let records: usize = batches.iter().map(|b| b.processed_count()).sum();
        if records == 0 {
            return Err(SchedulerError::NoObservationData(format!(
                "{} 个站点在 {} ~ {} 内没有观测数据",
                params.station_ids.len(),
                params.time_range.start,
                params.time_range.end
            )));
        }

        let mut written = 0;
        for batch in batches.iter().filter(|b| !b.is_empty()) {
            written += self.observations.upsert_batch(batch).await?;
        }
        counter!("snowcast_observations_stored_total").increment(written);
        info!(
            "Stored {} observation rows from {} station batch(es)",
            written,
            batches.len()
        );

        let run = self.progress.record_fetch(params, &batches).await?;
        Ok(json!({
            "run_id": run.id,
            "stage": run.stage.as_str(),
            "stations": batches.len(),
            "records": records,
        }))
    }
}

#[async_trait]
impl TaskHandler for FetchObservationsHandler {
    fn name(&self) -> &str {
        HANDLER_FETCH_OBSERVATIONS
    }

    async fn handle(&self, ctx: TaskContext) -> HandlerOutcome {
        let params: FetchParams = match ctx.task.payload_as() {
            Ok(params) => params,
            Err(e) => return HandlerOutcome::Fatal(e),
        };

        match self.execute(&params).await {
            Err(error @ SchedulerError::NoObservationData(_)) if self.retry_on_empty_fetch => {
                warn!("Observation source returned no data, retrying: {}", error);
                HandlerOutcome::retryable(error)
            }
            result => HandlerOutcome::from_result(result),
        }
    }
}
