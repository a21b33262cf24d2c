//! Scripted task handlers for exercising the worker pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use snowcast_core::{
    models::HandlerOutcome, SchedulerError, TaskContext, TaskHandler,
};

/// 处理器在一次执行中的行为
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    /// 返回可重试的失败
    Retry,
    /// 返回不可重试的失败
    Fatal,
    /// 睡眠指定时长后成功，用于测试时限
    Sleep(Duration),
    /// 睡眠直到软时限信号到达，然后成功返回
    UntilSoftLimit,
    Panic,
}

/// 按脚本依次执行的处理器，脚本用完后一直成功
pub struct ScriptedHandler {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new(name: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn always(name: &str, step: Step) -> Self {
        Self::new(name, std::iter::repeat(step).take(1024))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        match self.steps.lock() {
            Ok(mut steps) => steps.pop_front().unwrap_or(Step::Succeed),
            Err(_) => Step::Succeed,
        }
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, mut ctx: TaskContext) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        match self.next_step() {
            Step::Succeed => HandlerOutcome::Success(serde_json::json!({"task": ctx.task.id})),
            Step::Retry => HandlerOutcome::retryable(SchedulerError::TransientFetch(
                "scripted transient failure".to_string(),
            )),
            Step::Fatal => HandlerOutcome::Fatal(SchedulerError::InvalidTaskParams(
                "scripted fatal failure".to_string(),
            )),
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                HandlerOutcome::Success(serde_json::Value::Null)
            }
            Step::UntilSoftLimit => {
                ctx.soft_limit_signal().await;
                HandlerOutcome::Success(serde_json::json!({"soft_limit": true}))
            }
            Step::Panic => panic!("scripted handler panic"),
        }
    }
}
