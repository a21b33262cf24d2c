use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{SchedulerError, SchedulerResult};

/// 队列中的任务
///
/// 任务在入队后由 broker 独占持有，出队后由执行它的 worker 持有，
/// 重试时交还给 broker 并带上新的 ETA。
///
/// # 字段说明
///
/// - `id`: 任务唯一标识
/// - `queue_name`: 目标队列，如 `data_fetch`、`modeling`、`pipeline`
/// - `handler_name`: 处理器名称，如 `fetch.observations`
/// - `payload`: 处理器参数，JSON 格式
/// - `attempt_count`: 已经发生的重试次数，从 0 开始
/// - `max_attempts`: 允许的最大重试次数
/// - `eta`: 最早可执行时间
/// - `pipeline_run_id`: 所属的流水线运行（若有）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub queue_name: String,
    pub handler_name: String,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub eta: DateTime<Utc>,
    pub status: TaskStatus,
    pub pipeline_run_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Retrying,
    Succeeded,
    FailedPermanent,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::FailedPermanent => "failed_permanent",
        }
    }

    pub fn parse(s: &str) -> SchedulerResult<Self> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "retrying" => Ok(TaskStatus::Retrying),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed_permanent" => Ok(TaskStatus::FailedPermanent),
            other => Err(SchedulerError::Internal(format!("Invalid task status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::FailedPermanent)
    }
}

impl Task {
    /// 创建新任务，立即可执行
    pub fn new(
        queue_name: impl Into<String>,
        handler_name: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.into(),
            handler_name: handler_name.into(),
            payload,
            attempt_count: 0,
            max_attempts,
            eta: now,
            status: TaskStatus::Queued,
            pipeline_run_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_pipeline_run(mut self, run_id: Uuid) -> Self {
        self.pipeline_run_id = Some(run_id);
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.eta <= now
    }

    /// 是否还能再重试一次
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// 记录一次重试：递增计数并推迟 ETA
    ///
    /// 重试次数永远不会超过 `max_attempts`。
    pub fn schedule_retry(
        &mut self,
        delay: std::time::Duration,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        if !self.can_retry() {
            return Err(SchedulerError::RetryLimitExceeded {
                id: self.id,
                max_attempts: self.max_attempts,
            });
        }
        let delay = Duration::from_std(delay)
            .map_err(|e| SchedulerError::Internal(format!("retry delay out of range: {e}")))?;
        self.attempt_count += 1;
        self.eta = now + delay;
        self.status = TaskStatus::Retrying;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::FailedPermanent;
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    /// 反序列化任务参数
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> SchedulerResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            SchedulerError::InvalidTaskParams(format!(
                "解析任务 {} ({}) 参数失败: {e}",
                self.id, self.handler_name
            ))
        })
    }
}
