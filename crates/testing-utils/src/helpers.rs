//! 异步条件等待

use std::future::Future;
use std::time::Duration;

use snowcast_core::{models::PipelineRun, PipelineRunRepository, TaskBroker};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct TestEnv;

impl TestEnv {
    /// 每 20ms 检查一次条件，超时返回 `false`
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// 等到给定队列中没有就绪、延迟或在途的任务
    pub async fn wait_for_idle(broker: &dyn TaskBroker, queues: &[&str], timeout: Duration) -> bool {
        Self::wait_for(
            || async move {
                let mut busy = 0;
                for queue in queues {
                    match broker.queue_stats(queue).await {
                        Ok(stats) => busy += stats.ready + stats.delayed + stats.in_flight,
                        Err(_) => return false,
                    }
                }
                busy == 0
            },
            timeout,
        )
        .await
    }

    /// 等到运行进入 `completed` 或 `failed`，超时返回 `None`
    pub async fn wait_for_terminal_run(
        runs: &dyn PipelineRunRepository,
        run_id: Uuid,
        timeout: Duration,
    ) -> Option<PipelineRun> {
        let finished = Self::wait_for(
            || async move {
                matches!(runs.get(run_id).await, Ok(Some(run)) if run.is_terminal())
            },
            timeout,
        )
        .await;
        if !finished {
            return None;
        }
        runs.get(run_id).await.ok().flatten()
    }
}
