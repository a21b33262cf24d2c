use std::sync::Arc;

use async_trait::async_trait;

use snowcast_core::{
    models::{CleanupParams, HandlerOutcome},
    SchedulerResult, TaskContext, TaskHandler, HANDLER_CLEANUP,
};
use snowcast_infrastructure::CleanupService;

/// `pipeline.cleanup`：删除超过保留期的观测与结果
pub struct CleanupHandler {
    service: Arc<CleanupService>,
}

impl CleanupHandler {
    pub fn new(service: Arc<CleanupService>) -> Self {
        Self { service }
    }

    async fn execute(&self, ctx: &TaskContext) -> SchedulerResult<serde_json::Value> {
        let params: CleanupParams = ctx.task.payload_as()?;
        let stats = self.service.cleanup_once(params.retention_days).await?;
        Ok(serde_json::to_value(stats)?)
    }
}

#[async_trait]
impl TaskHandler for CleanupHandler {
    fn name(&self) -> &str {
        HANDLER_CLEANUP
    }

    async fn handle(&self, ctx: TaskContext) -> HandlerOutcome {
        HandlerOutcome::from_result(self.execute(&ctx).await)
    }
}
