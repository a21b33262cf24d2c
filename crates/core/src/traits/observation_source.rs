use async_trait::async_trait;

use crate::{
    models::{ObservationBatch, TimeRange},
    SchedulerResult,
};

/// 观测数据来源
///
/// 实现需要区分错误类型：网络或超时返回 `TransientFetch`，
/// 接口报告失败或响应无法解析返回 `FetchFailure`。
/// 接口成功但没有数据时返回空批次，由调用方决定如何处理。
#[async_trait]
pub trait ObservationSource: Send + Sync {
    async fn fetch(
        &self,
        station_ids: &[String],
        range: TimeRange,
    ) -> SchedulerResult<Vec<ObservationBatch>>;
}
