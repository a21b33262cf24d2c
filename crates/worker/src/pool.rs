use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use snowcast_core::{
    config::AppConfig,
    models::{HandlerOutcome, Task},
    BackoffDecision, SchedulerError, SchedulerResult, TaskBroker, TaskContext,
    TaskFailureListener,
};

use crate::rate_limit::HandlerRateLimiter;
use crate::registry::{HandlerRegistry, RegisteredHandler};

/// Worker池构建器
pub struct WorkerPoolBuilder {
    worker_id: String,
    broker: Arc<dyn TaskBroker>,
    registry: Arc<HandlerRegistry>,
    queues: Vec<(String, usize)>,
    poll_interval: Duration,
    max_tasks_per_child: u64,
    shutdown_grace: Duration,
    listener: Option<Arc<dyn TaskFailureListener>>,
}

impl WorkerPoolBuilder {
    /// 默认为注册表中的每个队列开一个执行槽
    pub fn new(broker: Arc<dyn TaskBroker>, registry: Arc<HandlerRegistry>) -> Self {
        let queues = registry.queues().into_iter().map(|q| (q, 1)).collect();
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            broker,
            registry,
            queues,
            poll_interval: Duration::from_millis(500),
            max_tasks_per_child: 1000,
            shutdown_grace: Duration::from_secs(30),
            listener: None,
        }
    }

    /// 按应用配置设置 worker ID、轮询间隔、槽位回收和各队列的槽位数
    pub fn from_config(
        config: &AppConfig,
        broker: Arc<dyn TaskBroker>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let queues = registry
            .queues()
            .into_iter()
            .map(|q| {
                let slots = config.broker.concurrency_for(&q);
                (q, slots)
            })
            .collect();
        Self {
            queues,
            ..Self::new(broker, registry)
        }
        .worker_id(config.worker.resolved_worker_id())
        .poll_interval(Duration::from_millis(config.worker.poll_interval_ms))
        .max_tasks_per_child(config.worker.max_tasks_per_child)
        .shutdown_grace(Duration::from_secs(config.worker.shutdown_grace_seconds))
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// 设置队列的执行槽数量
    pub fn queue_slots(mut self, queue: &str, slots: usize) -> Self {
        match self.queues.iter_mut().find(|(q, _)| q == queue) {
            Some(entry) => entry.1 = slots,
            None => self.queues.push((queue.to_string(), slots)),
        }
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// 每个执行槽处理多少个任务后重建
    pub fn max_tasks_per_child(mut self, max_tasks_per_child: u64) -> Self {
        self.max_tasks_per_child = max_tasks_per_child;
        self
    }

    pub fn shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// 任务永久失败时的通知对象
    pub fn failure_listener(mut self, listener: Arc<dyn TaskFailureListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> SchedulerResult<WorkerPool> {
        let known = self.registry.queues();
        for (queue, slots) in &self.queues {
            if !known.contains(queue) {
                return Err(SchedulerError::Configuration(format!(
                    "队列 {queue} 没有注册任何处理器"
                )));
            }
            if *slots == 0 {
                return Err(SchedulerError::Configuration(format!(
                    "队列 {queue} 的执行槽数必须大于0"
                )));
            }
        }
        if self.max_tasks_per_child == 0 {
            return Err(SchedulerError::Configuration(
                "执行槽最大任务数必须大于0".to_string(),
            ));
        }

        let rate_limiter = HandlerRateLimiter::from_catalog(self.registry.catalog());
        Ok(WorkerPool {
            shared: Arc::new(PoolShared {
                worker_id: self.worker_id,
                broker: self.broker,
                registry: self.registry,
                rate_limiter,
                listener: self.listener,
                poll_interval: self.poll_interval,
                max_tasks_per_child: self.max_tasks_per_child,
            }),
            queues: self.queues,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

#[derive(Debug, Clone)]
struct SlotId {
    queue: String,
    index: usize,
}

enum SlotExit {
    Stopped,
    /// 达到 `max_tasks_per_child` 后主动退出
    Recycled,
    Crashed,
}

/// 丢弃时中止任务，关闭或被中止的执行槽不会遗留处理器任务
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct PoolShared {
    worker_id: String,
    broker: Arc<dyn TaskBroker>,
    registry: Arc<HandlerRegistry>,
    rate_limiter: HandlerRateLimiter,
    listener: Option<Arc<dyn TaskFailureListener>>,
    poll_interval: Duration,
    max_tasks_per_child: u64,
}

/// Worker池
///
/// 每个队列有固定数量的执行槽，每个槽一次只执行一个任务。
/// 处理器在独立的 tokio 任务中运行，panic 和硬超时只影响当前任务。
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    queues: Vec<(String, usize)>,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    pub fn total_slots(&self) -> usize {
        self.queues.iter().map(|(_, slots)| slots).sum()
    }

    /// 运行直到收到关闭信号
    ///
    /// 关闭时停止出队，等待执行中的任务在宽限期内结束；
    /// 超时仍未结束的任务被中止，未确认的任务在可见性超时后重新投递。
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut slots = JoinSet::new();
        for (queue, count) in &self.queues {
            for index in 0..*count {
                self.spawn_slot(
                    &mut slots,
                    SlotId {
                        queue: queue.clone(),
                        index,
                    },
                    stop_rx.clone(),
                );
            }
        }
        info!(
            "Worker pool {} started with {} slot(s) across {} queue(s)",
            self.shared.worker_id,
            self.total_slots(),
            self.queues.len()
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Worker pool shutdown requested");
                    break;
                }
                joined = slots.join_next() => match joined {
                    Some(Ok((slot, SlotExit::Recycled))) => {
                        debug!("Recycling slot {}#{}", slot.queue, slot.index);
                        counter!("snowcast_worker_slots_recycled_total", "queue" => slot.queue.clone())
                            .increment(1);
                        self.spawn_slot(&mut slots, slot, stop_rx.clone());
                    }
                    Some(Ok((slot, SlotExit::Crashed))) => {
                        error!("Slot {}#{} crashed, restarting", slot.queue, slot.index);
                        counter!("snowcast_worker_slots_crashed_total", "queue" => slot.queue.clone())
                            .increment(1);
                        self.spawn_slot(&mut slots, slot, stop_rx.clone());
                    }
                    Some(Ok((_, SlotExit::Stopped))) => {}
                    Some(Err(e)) => error!("Worker slot join failed: {}", e),
                    None => break,
                }
            }
        }

        let _ = stop_tx.send(true);
        self.drain(slots).await;
        info!("Worker pool {} stopped", self.shared.worker_id);
    }

    fn spawn_slot(
        &self,
        slots: &mut JoinSet<(SlotId, SlotExit)>,
        slot: SlotId,
        stop_rx: watch::Receiver<bool>,
    ) {
        let shared = Arc::clone(&self.shared);
        slots.spawn(async move {
            let exit = AssertUnwindSafe(shared.run_slot(&slot, stop_rx))
                .catch_unwind()
                .await
                .unwrap_or(SlotExit::Crashed);
            (slot, exit)
        });
    }

    async fn drain(&self, mut slots: JoinSet<(SlotId, SlotExit)>) {
        let finished = tokio::time::timeout(self.shutdown_grace, async {
            while slots.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !finished {
            warn!(
                "Shutdown grace period {:?} elapsed with {} slot(s) still busy, aborting",
                self.shutdown_grace,
                slots.len()
            );
            slots.abort_all();
            while slots.join_next().await.is_some() {}
        }
    }
}

impl PoolShared {
    async fn run_slot(&self, slot: &SlotId, mut stop_rx: watch::Receiver<bool>) -> SlotExit {
        let mut executed = 0u64;
        loop {
            if *stop_rx.borrow() {
                return SlotExit::Stopped;
            }
            if executed >= self.max_tasks_per_child {
                return SlotExit::Recycled;
            }

            match self.broker.dequeue(&slot.queue).await {
                Ok(Some(task)) => {
                    self.process(task).await;
                    executed += 1;
                }
                Ok(None) => self.idle(&mut stop_rx).await,
                Err(e) => {
                    warn!("Failed to dequeue from {}: {}", slot.queue, e);
                    counter!("snowcast_worker_dequeue_errors_total", "queue" => slot.queue.clone())
                        .increment(1);
                    self.idle(&mut stop_rx).await;
                }
            }
        }
    }

    async fn idle(&self, stop_rx: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = stop_rx.changed() => {}
        }
    }

    async fn process(&self, task: Task) {
        let span = info_span!(
            "task",
            task_id = %task.id,
            handler = %task.handler_name,
            queue = %task.queue_name,
            attempt = task.attempt_count
        );
        self.process_task(task).instrument(span).await
    }

    async fn process_task(&self, task: Task) {
        let registered = match self.registry.get(&task.handler_name) {
            Ok(registered) => registered,
            Err(e) => {
                error!("Dequeued task has no registered handler: {}", e);
                self.fail_permanently(&task, e).await;
                return;
            }
        };

        let waited = self.rate_limiter.acquire(&task.handler_name).await;
        if waited >= Duration::from_secs(1) {
            debug!("Task delayed {:?} by rate limit", waited);
        }

        let started = Instant::now();
        let outcome = self.execute(&registered, &task).await;
        let elapsed = started.elapsed();

        histogram!("snowcast_task_duration_seconds", "handler" => task.handler_name.clone())
            .record(elapsed.as_secs_f64());
        counter!(
            "snowcast_tasks_processed_total",
            "handler" => task.handler_name.clone(),
            "outcome" => outcome.label()
        )
        .increment(1);

        self.settle(&registered, task, outcome, elapsed).await;
    }

    /// 在独立任务中执行处理器并施加软/硬时限
    async fn execute(&self, registered: &RegisteredHandler, task: &Task) -> HandlerOutcome {
        let spec = &registered.spec;
        let (soft_tx, soft_rx) = watch::channel(false);
        let ctx = TaskContext::new(
            task.clone(),
            self.worker_id.clone(),
            spec.soft_time_limit,
            soft_rx,
        );
        let handler = Arc::clone(&registered.handler);
        let mut execution = AbortOnDrop(tokio::spawn(
            async move { handler.handle(ctx).await }.instrument(Span::current()),
        ));

        let soft_deadline = tokio::time::sleep(spec.soft_time_limit);
        let hard_deadline = tokio::time::sleep(spec.hard_time_limit);
        tokio::pin!(soft_deadline, hard_deadline);
        let mut soft_fired = false;

        loop {
            tokio::select! {
                joined = &mut execution.0 => {
                    return match joined {
                        Ok(outcome) => outcome,
                        Err(e) if e.is_panic() => {
                            let message = panic_message(e.into_panic());
                            error!("Task handler panicked: {}", message);
                            HandlerOutcome::Fatal(SchedulerError::Internal(format!(
                                "处理器 {} 执行时 panic: {message}",
                                spec.name
                            )))
                        }
                        Err(e) => HandlerOutcome::Fatal(SchedulerError::Internal(e.to_string())),
                    };
                }
                _ = &mut soft_deadline, if !soft_fired => {
                    soft_fired = true;
                    warn!("Task exceeded soft time limit {:?}", spec.soft_time_limit);
                    counter!("snowcast_task_timeouts_total", "handler" => spec.name.clone(), "kind" => "soft")
                        .increment(1);
                    let _ = soft_tx.send(true);
                }
                _ = &mut hard_deadline => {
                    execution.0.abort();
                    error!(
                        "Task exceeded hard time limit {:?}, execution aborted",
                        spec.hard_time_limit
                    );
                    counter!("snowcast_task_timeouts_total", "handler" => spec.name.clone(), "kind" => "hard")
                        .increment(1);
                    return HandlerOutcome::retryable(SchedulerError::HardTimeout {
                        limit: spec.hard_time_limit,
                    });
                }
            }
        }
    }

    /// 按执行结果确认、退避重试或转为永久失败
    async fn settle(
        &self,
        registered: &RegisteredHandler,
        task: Task,
        outcome: HandlerOutcome,
        elapsed: Duration,
    ) {
        match outcome {
            HandlerOutcome::Success(result) => match self.broker.ack(task.id).await {
                Ok(()) => {
                    info!("Task completed in {}ms", elapsed.as_millis());
                    debug!("Task result: {}", result);
                }
                Err(e) => warn!("Failed to ack completed task: {}", e),
            },
            HandlerOutcome::Retryable { error, delay_hint } => {
                match registered
                    .spec
                    .backoff
                    .decide_with_hint(task.attempt_count, delay_hint)
                {
                    BackoffDecision::Retry { delay } => {
                        match self.broker.nack(task.id, delay).await {
                            Ok(retried) => warn!(
                                "Task failed, retry {}/{} scheduled in {:?}: {}",
                                retried.attempt_count, retried.max_attempts, delay, error
                            ),
                            Err(SchedulerError::RetryLimitExceeded { .. }) => {
                                self.fail_permanently(&task, error).await
                            }
                            Err(e) => error!(
                                "Failed to reschedule task, it will be redelivered after the visibility timeout: {}",
                                e
                            ),
                        }
                    }
                    BackoffDecision::GiveUp => self.fail_permanently(&task, error).await,
                }
            }
            HandlerOutcome::Fatal(error) => self.fail_permanently(&task, error).await,
        }
    }

    async fn fail_permanently(&self, task: &Task, error: SchedulerError) {
        let message = error.to_string();
        error!(
            "Task failed permanently after {} attempt(s): {}",
            task.attempt_count + 1,
            message
        );
        counter!("snowcast_tasks_failed_permanently_total", "handler" => task.handler_name.clone())
            .increment(1);

        let failed = match self.broker.fail(task.id, &message).await {
            Ok(failed) => failed,
            Err(e) => {
                error!("Failed to move task to the dead-letter list: {}", e);
                let mut failed = task.clone();
                failed.last_error = Some(message);
                failed
            }
        };

        if let Some(listener) = &self.listener {
            listener.on_permanent_failure(&failed, &error).await;
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
