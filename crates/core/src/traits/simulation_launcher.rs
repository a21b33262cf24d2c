use async_trait::async_trait;

use crate::{models::SimulationJob, SchedulerResult};

/// 外部进程的退出状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// 被信号终止时没有退出码
    pub exit_code: Option<i32>,
    pub stderr_tail: Option<String>,
}

impl ProcessExit {
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            stderr_tail: None,
        }
    }

    pub fn failed(exit_code: i32, stderr_tail: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr_tail: Some(stderr_tail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// 在隔离环境中启动一次模拟程序
///
/// 实现只负责运行进程并返回退出状态；非零退出不是错误，
/// 只有无法启动进程时才返回 `Err`。future 被丢弃时必须终止子进程。
#[async_trait]
pub trait SimulationLauncher: Send + Sync {
    async fn launch(&self, job: &SimulationJob) -> SchedulerResult<ProcessExit>;
}
