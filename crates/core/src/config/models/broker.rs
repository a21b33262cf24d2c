use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const QUEUE_DATA_FETCH: &str = "data_fetch";
pub const QUEUE_MODELING: &str = "modeling";
pub const QUEUE_PIPELINE: &str = "pipeline";

/// Broker backend type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    /// 进程内队列，调度与执行必须在同一进程
    #[default]
    Memory,
    /// SQLite 持久化队列，调度与执行可以分进程部署
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    /// 出队后未确认的任务在该时间后重新可见
    pub visibility_timeout_seconds: u64,
    /// 每个队列允许的最大在途任务数
    pub concurrency: BTreeMap<String, usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let mut concurrency = BTreeMap::new();
        concurrency.insert(QUEUE_DATA_FETCH.to_string(), 4);
        concurrency.insert(QUEUE_MODELING.to_string(), 2);
        concurrency.insert(QUEUE_PIPELINE.to_string(), 2);

        Self {
            backend: BrokerBackend::Memory,
            visibility_timeout_seconds: 3600,
            concurrency,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.visibility_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("可见性超时必须大于0"));
        }

        for queue in [QUEUE_DATA_FETCH, QUEUE_MODELING, QUEUE_PIPELINE] {
            if !self.concurrency.contains_key(queue) {
                return Err(anyhow::anyhow!("缺少队列 {} 的并发配置", queue));
            }
        }

        for (queue, limit) in &self.concurrency {
            if *limit == 0 {
                return Err(anyhow::anyhow!("队列 {} 的并发数必须大于0", queue));
            }
        }

        Ok(())
    }

    pub fn concurrency_for(&self, queue: &str) -> usize {
        self.concurrency.get(queue).copied().unwrap_or(1)
    }
}
