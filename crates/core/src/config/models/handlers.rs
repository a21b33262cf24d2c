use serde::{Deserialize, Serialize};

/// 单个处理器的限流、时限与重试注解，未填写的字段使用默认值
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HandlerAnnotation {
    pub name: String,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub soft_time_limit_seconds: Option<u64>,
    #[serde(default)]
    pub hard_time_limit_seconds: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_seconds: Option<u64>,
}

/// 合并默认值后的处理器限制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerLimits {
    pub rate_limit_per_minute: u32,
    pub soft_time_limit_seconds: u64,
    pub hard_time_limit_seconds: u64,
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
}

/// 处理器注解表
///
/// 配置文件中提供 `annotations` 时会整体替换内置注解。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlersConfig {
    pub default_rate_limit_per_minute: u32,
    pub default_soft_time_limit_seconds: u64,
    pub default_hard_time_limit_seconds: u64,
    pub default_max_attempts: u32,
    pub default_base_delay_seconds: u64,
    pub annotations: Vec<HandlerAnnotation>,
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self {
            default_rate_limit_per_minute: 100,
            default_soft_time_limit_seconds: 540,
            default_hard_time_limit_seconds: 600,
            default_max_attempts: 3,
            default_base_delay_seconds: 60,
            annotations: vec![
                HandlerAnnotation {
                    name: "fetch.observations".to_string(),
                    rate_limit_per_minute: Some(10),
                    soft_time_limit_seconds: Some(240),
                    hard_time_limit_seconds: Some(300),
                    max_attempts: Some(3),
                    base_delay_seconds: Some(60),
                },
                HandlerAnnotation {
                    name: "simulation.run_batch".to_string(),
                    rate_limit_per_minute: Some(5),
                    soft_time_limit_seconds: Some(1500),
                    hard_time_limit_seconds: Some(1800),
                    max_attempts: Some(1),
                    base_delay_seconds: Some(300),
                },
                HandlerAnnotation {
                    name: "pipeline.cleanup".to_string(),
                    max_attempts: Some(0),
                    ..Default::default()
                },
            ],
        }
    }
}

impl HandlersConfig {
    pub fn limits_for(&self, handler_name: &str) -> HandlerLimits {
        let annotation = self.annotations.iter().find(|a| a.name == handler_name);
        HandlerLimits {
            rate_limit_per_minute: annotation
                .and_then(|a| a.rate_limit_per_minute)
                .unwrap_or(self.default_rate_limit_per_minute),
            soft_time_limit_seconds: annotation
                .and_then(|a| a.soft_time_limit_seconds)
                .unwrap_or(self.default_soft_time_limit_seconds),
            hard_time_limit_seconds: annotation
                .and_then(|a| a.hard_time_limit_seconds)
                .unwrap_or(self.default_hard_time_limit_seconds),
            max_attempts: annotation
                .and_then(|a| a.max_attempts)
                .unwrap_or(self.default_max_attempts),
            base_delay_seconds: annotation
                .and_then(|a| a.base_delay_seconds)
                .unwrap_or(self.default_base_delay_seconds),
        }
    }

    /// 所有处理器中最长的硬时限
    pub fn max_hard_time_limit_seconds(&self) -> u64 {
        self.annotations
            .iter()
            .map(|a| self.limits_for(&a.name).hard_time_limit_seconds)
            .chain(std::iter::once(self.default_hard_time_limit_seconds))
            .max()
            .unwrap_or(self.default_hard_time_limit_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let names = std::iter::once("*").chain(self.annotations.iter().map(|a| a.name.as_str()));
        for name in names {
            if name.is_empty() {
                return Err(anyhow::anyhow!("处理器注解名称不能为空"));
            }
            let limits = self.limits_for(name);
            if limits.rate_limit_per_minute == 0 {
                return Err(anyhow::anyhow!("处理器 {} 的速率限制必须大于0", name));
            }
            if limits.hard_time_limit_seconds == 0 {
                return Err(anyhow::anyhow!("处理器 {} 的硬时限必须大于0", name));
            }
            if limits.soft_time_limit_seconds >= limits.hard_time_limit_seconds {
                return Err(anyhow::anyhow!(
                    "处理器 {} 的软时限({}s)必须小于硬时限({}s)",
                    name,
                    limits.soft_time_limit_seconds,
                    limits.hard_time_limit_seconds
                ));
            }
            if limits.max_attempts > 0 && limits.base_delay_seconds == 0 {
                return Err(anyhow::anyhow!("处理器 {} 的重试基础延迟必须大于0", name));
            }
        }

        Ok(())
    }
}
