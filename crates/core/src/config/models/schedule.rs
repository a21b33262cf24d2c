use serde::{Deserialize, Serialize};

/// 定时触发配置，时间均为 UTC
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub morning_run_hour: u32,
    pub evening_run_hour: u32,
    pub cleanup_hour: u32,
    pub tick_interval_seconds: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            morning_run_hour: 4,
            evening_run_hour: 16,
            cleanup_hour: 0,
            tick_interval_seconds: 15,
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, hour) in [
            ("morning_run_hour", self.morning_run_hour),
            ("evening_run_hour", self.evening_run_hour),
            ("cleanup_hour", self.cleanup_hour),
        ] {
            if hour > 23 {
                return Err(anyhow::anyhow!("{} 必须在0-23之间，当前值: {}", name, hour));
            }
        }

        // 同一分钟内至少检查一次，否则会漏掉触发
        if self.tick_interval_seconds == 0 || self.tick_interval_seconds >= 60 {
            return Err(anyhow::anyhow!(
                "调度检查间隔必须在1-59秒之间，当前值: {}",
                self.tick_interval_seconds
            ));
        }

        Ok(())
    }
}
