use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backoff::BackoffPolicy;
use crate::config::{HandlersConfig, QUEUE_DATA_FETCH, QUEUE_MODELING, QUEUE_PIPELINE};
use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::Task;

pub const HANDLER_PIPELINE_RUN: &str = "pipeline.run";
pub const HANDLER_FETCH_OBSERVATIONS: &str = "fetch.observations";
pub const HANDLER_SIMULATION_BATCH: &str = "simulation.run_batch";
pub const HANDLER_STORE_RESULTS: &str = "pipeline.store_results";
pub const HANDLER_CLEANUP: &str = "pipeline.cleanup";

/// 系统中所有处理器名称
pub const ALL_HANDLERS: [&str; 5] = [
    HANDLER_PIPELINE_RUN,
    HANDLER_FETCH_OBSERVATIONS,
    HANDLER_SIMULATION_BATCH,
    HANDLER_STORE_RESULTS,
    HANDLER_CLEANUP,
];

/// 队列路由表：处理器名称前缀到队列
const ROUTES: [(&str, &str); 3] = [
    ("fetch.", QUEUE_DATA_FETCH),
    ("simulation.", QUEUE_MODELING),
    ("pipeline.", QUEUE_PIPELINE),
];

/// 按路由表查找处理器所属队列
pub fn route_for(handler_name: &str) -> Option<&'static str> {
    ROUTES
        .iter()
        .find(|(prefix, _)| handler_name.starts_with(prefix))
        .map(|(_, queue)| *queue)
}

/// 处理器在注册时声明的全部属性
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSpec {
    pub name: String,
    pub queue: String,
    pub rate_limit_per_minute: u32,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    pub backoff: BackoffPolicy,
}

impl HandlerSpec {
    pub fn max_attempts(&self) -> u32 {
        self.backoff.max_attempts
    }
}

/// 任务目录
///
/// 启动时由路由表和注解表构建，之后作为只读的全局状态共享。
#[derive(Debug, Clone)]
pub struct TaskCatalog {
    specs: BTreeMap<String, HandlerSpec>,
}

impl TaskCatalog {
    /// 为给定的处理器名称构建目录
    pub fn new<'a>(
        handler_names: impl IntoIterator<Item = &'a str>,
        handlers: &HandlersConfig,
    ) -> SchedulerResult<Self> {
        let mut specs = BTreeMap::new();
        for name in handler_names {
            let queue = route_for(name).ok_or_else(|| {
                SchedulerError::Configuration(format!("处理器 {name} 没有匹配的队列路由"))
            })?;
            let limits = handlers.limits_for(name);
            let spec = HandlerSpec {
                name: name.to_string(),
                queue: queue.to_string(),
                rate_limit_per_minute: limits.rate_limit_per_minute,
                soft_time_limit: Duration::from_secs(limits.soft_time_limit_seconds),
                hard_time_limit: Duration::from_secs(limits.hard_time_limit_seconds),
                backoff: BackoffPolicy::new(
                    Duration::from_secs(limits.base_delay_seconds),
                    limits.max_attempts,
                ),
            };
            if specs.insert(name.to_string(), spec).is_some() {
                return Err(SchedulerError::Configuration(format!(
                    "处理器 {name} 重复注册"
                )));
            }
        }
        Ok(Self { specs })
    }

    /// 包含系统全部处理器的目录
    pub fn standard(handlers: &HandlersConfig) -> SchedulerResult<Self> {
        Self::new(ALL_HANDLERS, handlers)
    }

    pub fn spec(&self, handler_name: &str) -> SchedulerResult<&HandlerSpec> {
        self.specs
            .get(handler_name)
            .ok_or_else(|| SchedulerError::HandlerNotFound {
                name: handler_name.to_string(),
            })
    }

    pub fn specs(&self) -> impl Iterator<Item = &HandlerSpec> {
        self.specs.values()
    }

    pub fn contains(&self, handler_name: &str) -> bool {
        self.specs.contains_key(handler_name)
    }

    /// 目录中出现的全部队列
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.specs.values().map(|s| s.queue.clone()).collect();
        queues.sort();
        queues.dedup();
        queues
    }

    /// 创建任务并填入队列与最大重试次数
    pub fn new_task(
        &self,
        handler_name: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Task> {
        let spec = self.spec(handler_name)?;
        Ok(Task::new(
            spec.queue.clone(),
            handler_name,
            payload,
            spec.max_attempts(),
            now,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_routing_table() {
        assert_eq!(route_for("fetch.observations"), Some("data_fetch"));
        assert_eq!(route_for("simulation.run_batch"), Some("modeling"));
        assert_eq!(route_for("pipeline.cleanup"), Some("pipeline"));
        assert_eq!(route_for("unknown.task"), None);
    }

    #[test]
    fn test_standard_catalog() {
        let catalog = TaskCatalog::standard(&HandlersConfig::default()).unwrap();
        assert_eq!(catalog.queues(), vec!["data_fetch", "modeling", "pipeline"]);

        let fetch = catalog.spec(HANDLER_FETCH_OBSERVATIONS).unwrap();
        assert_eq!(fetch.rate_limit_per_minute, 10);
        assert_eq!(fetch.hard_time_limit, Duration::from_secs(300));
        assert_eq!(fetch.backoff.base_delay, Duration::from_secs(60));

        let cleanup = catalog.spec(HANDLER_CLEANUP).unwrap();
        assert_eq!(cleanup.max_attempts(), 0);
    }

    #[test]
    fn test_new_task_fills_queue_and_attempts() {
        let catalog = TaskCatalog::standard(&HandlersConfig::default()).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 4, 0, 0).unwrap();
        let task = catalog
            .new_task(HANDLER_FETCH_OBSERVATIONS, serde_json::json!({}), now)
            .unwrap();
        assert_eq!(task.queue_name, "data_fetch");
        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.eta, now);

        assert!(matches!(
            catalog.new_task("missing.handler", serde_json::json!({}), now),
            Err(SchedulerError::HandlerNotFound { .. })
        ));
    }

    #[test]
    fn test_unroutable_handler_rejected() {
        let result = TaskCatalog::new(["report.daily"], &HandlersConfig::default());
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));
    }
}
