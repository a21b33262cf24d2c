//! 数据仓储层接口定义
//!
//! - `StationRepository` - 气象站列表与最后采集时间
//! - `ObservationRepository` - 观测数据，按 `(站点, 时间区间)` 整体替换
//! - `SimulationResultRepository` - 模拟结果，按 `(run_id, 配置)` 覆盖
//! - `PipelineRunRepository` - 流水线运行记录
//!
//! 所有写操作都是幂等的 upsert，重复投递的任务不会产生重复数据。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    models::{
        ObservationBatch, PipelineRun, PipelineRunQuery, PipelineStage, SimulationResultRecord,
        Station,
    },
    SchedulerResult,
};

/// 气象站仓储接口
#[async_trait]
pub trait StationRepository: Send + Sync {
    async fn upsert(&self, station: &Station) -> SchedulerResult<()>;

    async fn list_active(&self) -> SchedulerResult<Vec<Station>>;

    async fn get_by_external_id(&self, external_identifier: &str)
        -> SchedulerResult<Option<Station>>;

    /// 更新最后采集时间，只允许向后推进
    async fn update_last_fetch_time(
        &self,
        external_identifiers: &[String],
        fetched_until: DateTime<Utc>,
    ) -> SchedulerResult<u64>;
}

/// 观测数据仓储接口
#[async_trait]
pub trait ObservationRepository: Send + Sync {
    /// 以 `(station_id, time_range)` 为键替换整批记录，返回写入行数
    async fn upsert_batch(&self, batch: &ObservationBatch) -> SchedulerResult<u64>;

    async fn count_records(&self, station_id: Option<&str>) -> SchedulerResult<u64>;

    /// 删除观测时间早于 `cutoff` 的记录
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64>;
}

/// 模拟结果仓储接口
#[async_trait]
pub trait SimulationResultRepository: Send + Sync {
    async fn upsert_result(&self, record: &SimulationResultRecord) -> SchedulerResult<()>;

    async fn results_for_run(&self, run_id: Uuid) -> SchedulerResult<Vec<SimulationResultRecord>>;

    async fn count_results(&self) -> SchedulerResult<u64>;

    /// 删除创建时间早于 `cutoff` 的结果
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64>;
}

/// 流水线运行仓储接口
#[async_trait]
pub trait PipelineRunRepository: Send + Sync {
    /// 创建运行记录，已存在时返回 `false` 且不修改
    async fn create(&self, run: &PipelineRun) -> SchedulerResult<bool>;

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<PipelineRun>>;

    /// 仅当存储中的阶段仍为 `expected` 时写入，返回是否写入成功
    async fn update(&self, run: &PipelineRun, expected: PipelineStage) -> SchedulerResult<bool>;

    /// 按创建时间倒序返回匹配的记录
    async fn query(&self, query: &PipelineRunQuery) -> SchedulerResult<Vec<PipelineRun>>;
}
