use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

use snowcast_core::{
    config::ScheduleConfig,
    models::{CleanupParams, PipelineRunParams, ScheduleEntry, Task},
    Clock, SchedulerError, SchedulerResult, TaskBroker, TaskCatalog, HANDLER_CLEANUP,
    HANDLER_PIPELINE_RUN,
};

use crate::cron_utils::CronScheduler;

pub const MORNING_RUN_LABEL: &str = "morning_run";
pub const EVENING_RUN_LABEL: &str = "evening_run";
pub const CLEANUP_TRIGGER: &str = "cleanup";

struct Trigger {
    entry: ScheduleEntry,
    cron: CronScheduler,
}

/// 定时触发器
///
/// 按固定的触发表把时间条件转换为入队操作。每个匹配的分钟只入队一次；
/// 入队失败不记录，下一次检查时会再次尝试。停机期间错过的触发不会补发。
pub struct TriggerScheduler {
    triggers: Vec<Trigger>,
    broker: Arc<dyn TaskBroker>,
    catalog: Arc<TaskCatalog>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
}

/// 系统的三个固定触发条目：早间运行、晚间运行和每日清理
pub fn standard_entries(config: &ScheduleConfig) -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry::daily(
            MORNING_RUN_LABEL,
            config.morning_run_hour,
            0,
            HANDLER_PIPELINE_RUN,
            Some(MORNING_RUN_LABEL.to_string()),
        ),
        ScheduleEntry::daily(
            EVENING_RUN_LABEL,
            config.evening_run_hour,
            0,
            HANDLER_PIPELINE_RUN,
            Some(EVENING_RUN_LABEL.to_string()),
        ),
        ScheduleEntry::daily(CLEANUP_TRIGGER, config.cleanup_hour, 0, HANDLER_CLEANUP, None),
    ]
}

impl TriggerScheduler {
    pub fn new(
        entries: Vec<ScheduleEntry>,
        broker: Arc<dyn TaskBroker>,
        catalog: Arc<TaskCatalog>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> SchedulerResult<Self> {
        let mut triggers = Vec::with_capacity(entries.len());
        for entry in entries {
            if !catalog.contains(&entry.handler_name) {
                return Err(SchedulerError::HandlerNotFound {
                    name: entry.handler_name.clone(),
                });
            }
            let cron = CronScheduler::new(&entry.cron_expression())?;
            triggers.push(Trigger { entry, cron });
        }

        Ok(Self {
            triggers,
            broker,
            catalog,
            clock,
            tick_interval,
            last_fired: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(
        config: &ScheduleConfig,
        broker: Arc<dyn TaskBroker>,
        catalog: Arc<TaskCatalog>,
        clock: Arc<dyn Clock>,
    ) -> SchedulerResult<Self> {
        Self::new(
            standard_entries(config),
            broker,
            catalog,
            clock,
            Duration::from_secs(config.tick_interval_seconds),
        )
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.triggers.iter().map(|t| &t.entry)
    }

    /// 检查一次触发表，返回本次入队的任务
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<Task> {
        let mut enqueued = Vec::new();

        for trigger in &self.triggers {
            let Some(minute) = trigger.cron.matching_minute(now) else {
                continue;
            };

            let trigger_id = &trigger.entry.trigger_id;
            if self.last_fired.lock().await.get(trigger_id) == Some(&minute) {
                continue;
            }

            match self.fire(&trigger.entry, now).await {
                Ok(task) => {
                    self.last_fired
                        .lock()
                        .await
                        .insert(trigger_id.clone(), minute);
                    info!(
                        "Trigger {} fired for {}, enqueued task {} ({})",
                        trigger_id,
                        minute.format("%Y-%m-%d %H:%M UTC"),
                        task.id,
                        task.handler_name
                    );
                    counter!("snowcast_triggers_fired_total", "trigger" => trigger_id.clone())
                        .increment(1);
                    enqueued.push(task);
                }
                Err(e) => {
                    error!(
                        "Trigger {} failed to enqueue, will retry on next tick: {}",
                        trigger_id, e
                    );
                    counter!("snowcast_trigger_enqueue_failures_total", "trigger" => trigger_id.clone())
                        .increment(1);
                }
            }
        }

        enqueued
    }

    /// 立即触发一次，`label` 为 `cleanup` 时入队清理任务，否则启动一个带该标签的运行
    pub async fn trigger_now(&self, label: &str) -> SchedulerResult<Task> {
        let now = self.clock.now();
        let entry = if label == CLEANUP_TRIGGER {
            ScheduleEntry::daily(CLEANUP_TRIGGER, 0, 0, HANDLER_CLEANUP, None)
        } else {
            ScheduleEntry::daily(label, 0, 0, HANDLER_PIPELINE_RUN, Some(label.to_string()))
        };
        let task = self.fire(&entry, now).await?;
        info!("Manually triggered {} as task {}", label, task.id);
        Ok(task)
    }

    /// 每次触发都会生成新的运行 ID，同一标签的并发触发得到不同的运行
    fn build_task(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> SchedulerResult<Task> {
        if entry.handler_name == HANDLER_PIPELINE_RUN {
            let run_id = Uuid::new_v4();
            let params = PipelineRunParams {
                run_id,
                trigger_label: entry
                    .label
                    .clone()
                    .unwrap_or_else(|| entry.trigger_id.clone()),
            };
            let task = self.catalog.new_task(
                HANDLER_PIPELINE_RUN,
                serde_json::to_value(params)?,
                now,
            )?;
            Ok(task.with_pipeline_run(run_id))
        } else {
            self.catalog.new_task(
                &entry.handler_name,
                serde_json::to_value(CleanupParams::default())?,
                now,
            )
        }
    }

    async fn fire(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> SchedulerResult<Task> {
        let task = self.build_task(entry, now)?;
        self.broker
            .enqueue(task.clone(), &task.queue_name, task.eta)
            .await?;
        Ok(task)
    }

    /// 按检查间隔循环，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Trigger scheduler started with {} trigger(s), tick interval {:?}",
            self.triggers.len(),
            self.tick_interval
        );
        for trigger in &self.triggers {
            if let Some(next) = trigger.cron.next_execution_time(self.clock.now()) {
                debug!("Trigger {} next fires at {}", trigger.entry.trigger_id, next);
            }
        }

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(self.clock.now()).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Trigger scheduler shutdown requested");
                    break;
                }
            }
        }

        info!("Trigger scheduler stopped");
    }
}
