use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use snowcast_core::{
    models::{HandlerOutcome, PipelineStage, SimulationBatchParams},
    PipelineProgress, SchedulerError, SchedulerResult, TaskContext, TaskHandler,
    HANDLER_SIMULATION_BATCH,
};

use crate::runner::SimulationRunner;

/// `simulation.run_batch`：对配置目录中的全部配置运行模拟程序
///
/// 单个作业失败不会让任务失败；只有协调器按成功策略判定运行失败时
/// 任务才以 `SimulationProcess` 错误结束。软时限到达后中断批次，
/// 不记录部分结果，以可重试的 `SoftTimeout` 返回。
pub struct SimulationBatchHandler {
    runner: Arc<SimulationRunner>,
    progress: Arc<dyn PipelineProgress>,
}

impl SimulationBatchHandler {
    pub fn new(runner: Arc<SimulationRunner>, progress: Arc<dyn PipelineProgress>) -> Self {
        Self { runner, progress }
    }

    async fn execute(&self, ctx: &mut TaskContext) -> SchedulerResult<serde_json::Value> {
        let params: SimulationBatchParams = ctx.task.payload_as()?;
        let limit = ctx.soft_time_limit();
        let execution = self
            .runner
            .run_batch_until(&params, ctx.soft_limit_signal())
            .await?;
        if execution.interrupted {
            return Err(SchedulerError::SoftTimeout { limit });
        }

        let report = execution.report;
        let run = self.progress.record_simulation(&report).await?;

        if run.stage == PipelineStage::Failed {
            let error = match report.jobs.iter().find(|job| !job.is_succeeded()) {
                Some(job) => SchedulerError::SimulationProcess {
                    config_identifier: job.config_identifier.clone(),
                    exit_code: job.exit_code,
                    stderr_tail: job.error().map(str::to_string),
                },
                None => SchedulerError::Internal(format!("运行 {} 已失败", run.id)),
            };
            return Err(error);
        }

        Ok(json!({
            "run_id": run.id,
            "stage": run.stage.as_str(),
            "succeeded": report.succeeded(),
            "failed": report.failed(),
            "total": report.total(),
        }))
    }
}

#[async_trait]
impl TaskHandler for SimulationBatchHandler {
    fn name(&self) -> &str {
        HANDLER_SIMULATION_BATCH
    }

    async fn handle(&self, mut ctx: TaskContext) -> HandlerOutcome {
        HandlerOutcome::from_result(self.execute(&mut ctx).await)
    }
}
