use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 为空时使用主机名
    pub worker_id: String,
    pub poll_interval_ms: u64,
    /// 每个执行槽处理多少个任务后重建
    pub max_tasks_per_child: u64,
    pub shutdown_grace_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            poll_interval_ms: 500,
            max_tasks_per_child: 1000,
            shutdown_grace_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }

        if self.max_tasks_per_child == 0 {
            return Err(anyhow::anyhow!("执行槽最大任务数必须大于0"));
        }

        Ok(())
    }

    /// 配置的 worker ID，未配置时回退到主机名
    pub fn resolved_worker_id(&self) -> String {
        if !self.worker_id.is_empty() {
            return self.worker_id.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .map(|h| format!("{h}-{}", std::process::id()))
            .unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }
}
