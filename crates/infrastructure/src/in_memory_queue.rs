use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use snowcast_core::{
    models::{Task, TaskStatus},
    Clock, QueueStats, SchedulerError, SchedulerResult, SystemClock, TaskBroker,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 内存任务队列实现
///
/// 适用于调度器与 worker 运行在同一进程的嵌入式部署。每个队列维护
/// 待执行列表、在途表（带可见性截止时间）和死信列表，在途数达到上限时
/// 该队列停止出队，其他队列不受影响。
pub struct InMemoryTaskBroker {
    state: Mutex<BrokerState>,
    visibility_timeout: chrono::Duration,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct BrokerState {
    tasks: HashMap<Uuid, Task>,
    queues: BTreeMap<String, QueueState>,
}

struct QueueState {
    limit: usize,
    /// 按入队顺序排列，出队时跳过 ETA 未到的任务
    pending: VecDeque<Uuid>,
    /// 任务 ID -> 可见性截止时间
    in_flight: HashMap<Uuid, DateTime<Utc>>,
    dead: Vec<Uuid>,
}

impl QueueState {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            dead: Vec::new(),
        }
    }
}

impl InMemoryTaskBroker {
    /// 创建内存队列，`queues` 为队列名到最大在途数的映射
    pub fn new<I, S>(queues: I, visibility_timeout: Duration) -> SchedulerResult<Self>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        Self::with_clock(queues, visibility_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock<I, S>(
        queues: I,
        visibility_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> SchedulerResult<Self>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let visibility_timeout = chrono::Duration::from_std(visibility_timeout)
            .map_err(|e| SchedulerError::Configuration(format!("可见性超时无效: {e}")))?;

        let mut state = BrokerState::default();
        for (name, limit) in queues {
            let name = name.into();
            if limit == 0 {
                return Err(SchedulerError::Configuration(format!(
                    "队列 {name} 的并发数必须大于0"
                )));
            }
            state.queues.insert(name, QueueState::new(limit));
        }

        info!(
            "Creating in-memory task broker with queues: {:?}",
            state.queues.keys().collect::<Vec<_>>()
        );

        Ok(Self {
            state: Mutex::new(state),
            visibility_timeout,
            clock,
        })
    }

    /// 将超过可见性截止时间的在途任务放回队列，不增加重试计数
    fn reclaim_expired(state: &mut BrokerState, queue: &str, now: DateTime<Utc>) {
        let BrokerState { tasks, queues } = state;
        let Some(queue_state) = queues.get_mut(queue) else {
            return;
        };

        let expired: Vec<Uuid> = queue_state
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            queue_state.in_flight.remove(&id);
            if let Some(task) = tasks.get_mut(&id) {
                task.status = TaskStatus::Queued;
                task.updated_at = now;
            }
            queue_state.pending.push_back(id);
            warn!("Task {} in queue {} exceeded visibility timeout, redelivering", id, queue);
            counter!("snowcast_broker_redeliveries_total", "queue" => queue.to_string())
                .increment(1);
        }
    }

    fn queue_mut<'a>(
        queues: &'a mut BTreeMap<String, QueueState>,
        queue: &str,
    ) -> SchedulerResult<&'a mut QueueState> {
        queues
            .get_mut(queue)
            .ok_or_else(|| SchedulerError::MessageQueue(format!("未知队列: {queue}")))
    }
}

#[async_trait]
impl TaskBroker for InMemoryTaskBroker {
    async fn enqueue(&self, mut task: Task, queue: &str, eta: DateTime<Utc>) -> SchedulerResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let BrokerState { tasks, queues } = &mut *state;
        let queue_state = Self::queue_mut(queues, queue)?;

        // 同一任务重复入队时只保留一份
        queue_state.pending.retain(|id| *id != task.id);
        queue_state.in_flight.remove(&task.id);

        task.queue_name = queue.to_string();
        task.eta = eta;
        if task.status != TaskStatus::Retrying {
            task.status = TaskStatus::Queued;
        }
        task.updated_at = now;

        debug!(
            "Enqueued task {} ({}) to queue {} with eta {}",
            task.id, task.handler_name, queue, eta
        );
        queue_state.pending.push_back(task.id);
        tasks.insert(task.id, task);
        counter!("snowcast_broker_enqueued_total", "queue" => queue.to_string()).increment(1);
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> SchedulerResult<Option<Task>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Self::reclaim_expired(&mut state, queue, now);

        let BrokerState { tasks, queues } = &mut *state;
        let queue_state = Self::queue_mut(queues, queue)?;

        if queue_state.in_flight.len() >= queue_state.limit {
            return Ok(None);
        }

        let position = queue_state
            .pending
            .iter()
            .position(|id| tasks.get(id).is_some_and(|t| t.is_ready(now)));
        let Some(position) = position else {
            return Ok(None);
        };
        let Some(id) = queue_state.pending.remove(position) else {
            return Ok(None);
        };
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };

        task.status = TaskStatus::Running;
        task.updated_at = now;
        queue_state
            .in_flight
            .insert(id, now + self.visibility_timeout);

        Ok(Some(task.clone()))
    }

    async fn ack(&self, task_id: Uuid) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let BrokerState { tasks, queues } = &mut *state;
        let task = tasks
            .remove(&task_id)
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        if let Some(queue_state) = queues.get_mut(&task.queue_name) {
            queue_state.in_flight.remove(&task_id);
            queue_state.pending.retain(|id| *id != task_id);
        }
        debug!("Acked task {} in queue {}", task_id, task.queue_name);
        Ok(())
    }

    async fn nack(&self, task_id: Uuid, retry_delay: Duration) -> SchedulerResult<Task> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let BrokerState { tasks, queues } = &mut *state;
        let task = tasks
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        task.schedule_retry(retry_delay, now)?;

        let queue_state = Self::queue_mut(queues, &task.queue_name)?;
        queue_state.in_flight.remove(&task_id);
        queue_state.pending.retain(|id| *id != task_id);
        queue_state.pending.push_back(task_id);

        debug!(
            "Task {} scheduled for retry {}/{} at {}",
            task_id, task.attempt_count, task.max_attempts, task.eta
        );
        Ok(task.clone())
    }

    async fn fail(&self, task_id: Uuid, error: &str) -> SchedulerResult<Task> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let BrokerState { tasks, queues } = &mut *state;
        let task = tasks
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        task.mark_failed(error, now);

        let queue_state = Self::queue_mut(queues, &task.queue_name)?;
        queue_state.in_flight.remove(&task_id);
        queue_state.pending.retain(|id| *id != task_id);
        if !queue_state.dead.contains(&task_id) {
            queue_state.dead.push(task_id);
        }
        Ok(task.clone())
    }

    async fn queue_stats(&self, queue: &str) -> SchedulerResult<QueueStats> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let queue_state = state
            .queues
            .get(queue)
            .ok_or_else(|| SchedulerError::MessageQueue(format!("未知队列: {queue}")))?;

        let (ready, delayed) = queue_state
            .pending
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .fold((0, 0), |(ready, delayed), task| {
                if task.is_ready(now) {
                    (ready + 1, delayed)
                } else {
                    (ready, delayed + 1)
                }
            });

        Ok(QueueStats {
            queue: queue.to_string(),
            ready,
            delayed,
            in_flight: queue_state.in_flight.len(),
            failed: queue_state.dead.len(),
            concurrency_limit: queue_state.limit,
        })
    }

    async fn failed_tasks(&self, queue: Option<&str>) -> SchedulerResult<Vec<Task>> {
        let state = self.state.lock().await;
        let tasks = state
            .queues
            .iter()
            .filter(|(name, _)| queue.map_or(true, |q| q == name.as_str()))
            .flat_map(|(_, queue_state)| queue_state.dead.iter())
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect();
        Ok(tasks)
    }
}
