use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    models::{FetchParams, ObservationBatch, PipelineRun, SimulationBatchReport, Task},
    SchedulerError, SchedulerResult,
};

/// 流水线阶段推进接口
///
/// 各阶段的处理器完成工作后通过它上报，由协调器决定是否进入下一阶段。
/// 所有方法对重复调用都是幂等的：已经越过的阶段再次上报不会产生效果。
#[async_trait]
pub trait PipelineProgress: Send + Sync {
    /// 创建运行记录并进入采集阶段
    async fn start_run(&self, run_id: Uuid, trigger_label: &str) -> SchedulerResult<PipelineRun>;

    /// 采集完成，准备模拟输入并进入模拟阶段
    async fn record_fetch(
        &self,
        params: &FetchParams,
        batches: &[ObservationBatch],
    ) -> SchedulerResult<PipelineRun>;

    /// 模拟批次结束，按成功策略进入入库阶段或失败
    async fn record_simulation(
        &self,
        report: &SimulationBatchReport,
    ) -> SchedulerResult<PipelineRun>;

    /// 入库完成
    async fn record_store(&self, run_id: Uuid, stored: usize) -> SchedulerResult<PipelineRun>;

    /// 将运行标记为失败
    async fn fail_run(&self, run_id: Uuid, error: &str) -> SchedulerResult<PipelineRun>;
}

/// 任务永久失败的通知接口
#[async_trait]
pub trait TaskFailureListener: Send + Sync {
    async fn on_permanent_failure(&self, task: &Task, error: &SchedulerError);
}
