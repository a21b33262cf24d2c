use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use snowcast_core::{
    models::{HandlerOutcome, PipelineRunParams},
    PipelineProgress, SchedulerResult, TaskContext, TaskHandler, HANDLER_PIPELINE_RUN,
};

/// `pipeline.run`：创建运行记录并进入采集阶段
pub struct PipelineRunHandler {
    progress: Arc<dyn PipelineProgress>,
}

impl PipelineRunHandler {
    pub fn new(progress: Arc<dyn PipelineProgress>) -> Self {
        Self { progress }
    }

    async fn execute(&self, ctx: &TaskContext) -> SchedulerResult<serde_json::Value> {
        let params: PipelineRunParams = ctx.task.payload_as()?;
        let run = self
            .progress
            .start_run(params.run_id, &params.trigger_label)
            .await?;
        info!(
            "Pipeline run {} ({}) is in stage {}",
            run.id, run.trigger_label, run.stage
        );
        Ok(json!({ "run_id": run.id, "stage": run.stage.as_str() }))
    }
}

#[async_trait]
impl TaskHandler for PipelineRunHandler {
    fn name(&self) -> &str {
        HANDLER_PIPELINE_RUN
    }

    async fn handle(&self, ctx: TaskContext) -> HandlerOutcome {
        HandlerOutcome::from_result(self.execute(&ctx).await)
    }
}
