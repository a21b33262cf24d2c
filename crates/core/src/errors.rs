use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("观测数据请求失败(可重试): {0}")]
    TransientFetch(String),

    #[error("观测数据接口返回失败: {0}")]
    FetchFailure(String),

    #[error("观测数据为空: {0}")]
    NoObservationData(String),

    #[error("模拟程序退出异常: config={config_identifier}, exit_code={exit_code:?}")]
    SimulationProcess {
        config_identifier: String,
        exit_code: Option<i32>,
        stderr_tail: Option<String>,
    },

    #[error("任务超过软时间限制: {limit:?}")]
    SoftTimeout { limit: Duration },

    #[error("任务超过硬时间限制被强制终止: {limit:?}")]
    HardTimeout { limit: Duration },

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: Uuid },

    #[error("流水线运行未找到: {id}")]
    PipelineRunNotFound { id: Uuid },

    #[error("未注册的任务处理器: {name}")]
    HandlerNotFound { name: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("非法的阶段转换: {from} -> {to}")]
    InvalidStageTransition { from: String, to: String },

    #[error("任务 {id} 已达到最大重试次数 {max_attempts}")]
    RetryLimitExceeded { id: Uuid, max_attempts: u32 },

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 错误是否值得按退避策略重试
    ///
    /// 网络抖动、接口失败、超时和存储错误都会重试；
    /// 模拟程序的非零退出、参数错误和状态机错误重试也不会改变结果。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::TransientFetch(_)
                | SchedulerError::FetchFailure(_)
                | SchedulerError::SoftTimeout { .. }
                | SchedulerError::HardTimeout { .. }
                | SchedulerError::Storage(_)
                | SchedulerError::Database(_)
                | SchedulerError::Io(_)
                | SchedulerError::MessageQueue(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SchedulerError::SoftTimeout { .. } | SchedulerError::HardTimeout { .. }
        )
    }

    pub fn storage<E: std::fmt::Display>(err: E) -> Self {
        SchedulerError::Storage(err.to_string())
    }

    pub fn message_queue<E: std::fmt::Display>(err: E) -> Self {
        SchedulerError::MessageQueue(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SchedulerError::TransientFetch("timeout".into()).is_retryable());
        assert!(SchedulerError::FetchFailure("code 2".into()).is_retryable());
        assert!(SchedulerError::HardTimeout {
            limit: Duration::from_secs(300)
        }
        .is_retryable());
        assert!(SchedulerError::Storage("locked".into()).is_retryable());

        assert!(!SchedulerError::NoObservationData("empty".into()).is_retryable());
        assert!(!SchedulerError::SimulationProcess {
            config_identifier: "a".into(),
            exit_code: Some(1),
            stderr_tail: None,
        }
        .is_retryable());
        assert!(!SchedulerError::InvalidTaskParams("bad".into()).is_retryable());
    }
}
