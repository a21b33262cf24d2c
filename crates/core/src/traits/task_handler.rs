use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::models::{HandlerOutcome, Task};

/// 传给处理器的执行上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub worker_id: String,
    soft_time_limit: Duration,
    soft_limit: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn new(
        task: Task,
        worker_id: impl Into<String>,
        soft_time_limit: Duration,
        soft_limit: watch::Receiver<bool>,
    ) -> Self {
        Self {
            task,
            worker_id: worker_id.into(),
            soft_time_limit,
            soft_limit,
        }
    }

    pub fn soft_time_limit(&self) -> Duration {
        self.soft_time_limit
    }

    /// 是否已超过软时限
    ///
    /// 软时限只是提示，处理器可以据此保存进度后尽快返回。
    pub fn soft_limit_reached(&self) -> bool {
        *self.soft_limit.borrow()
    }

    /// 等待软时限到达；发送端关闭时永不返回
    pub async fn soft_limit_signal(&mut self) {
        loop {
            if *self.soft_limit.borrow_and_update() {
                return;
            }
            if self.soft_limit.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// 任务处理器接口
///
/// 处理器不自行重试，通过返回值告诉 worker 下一步如何处理。
/// 由于至少一次投递，同一任务可能被执行多次，实现必须幂等。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: TaskContext) -> HandlerOutcome;
}
