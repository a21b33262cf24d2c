use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{models::Task, SchedulerResult};

/// 单个队列的实时统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: String,
    /// 已到 ETA、等待出队的任务
    pub ready: usize,
    /// ETA 在未来的任务
    pub delayed: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub concurrency_limit: usize,
}

/// 任务队列抽象接口
///
/// 至少一次投递：出队后的任务在确认前一直处于占用状态，
/// 超过可见性超时仍未确认会重新变为可见。每个队列的在途任务数
/// 独立受限，一个队列占满不会影响其他队列出队。
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// 将任务放入指定队列，在 `eta` 之前不可出队
    async fn enqueue(&self, task: Task, queue: &str, eta: DateTime<Utc>) -> SchedulerResult<()>;

    /// 取出一个已到期的任务；队列为空或在途数已达上限时返回 `None`
    async fn dequeue(&self, queue: &str) -> SchedulerResult<Option<Task>>;

    /// 确认任务处理完成
    async fn ack(&self, task_id: Uuid) -> SchedulerResult<()>;

    /// 放回队列延迟重试，重试计数加一；超过最大重试次数时返回 `RetryLimitExceeded`
    async fn nack(&self, task_id: Uuid, retry_delay: Duration) -> SchedulerResult<Task>;

    /// 标记为永久失败并移入死信列表
    async fn fail(&self, task_id: Uuid, error: &str) -> SchedulerResult<Task>;

    /// 获取队列统计
    async fn queue_stats(&self, queue: &str) -> SchedulerResult<QueueStats>;

    /// 获取永久失败的任务，`queue` 为 `None` 时返回全部队列
    async fn failed_tasks(&self, queue: Option<&str>) -> SchedulerResult<Vec<Task>>;
}
