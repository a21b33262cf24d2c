use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    broker::BrokerConfig,
    database::DatabaseConfig,
    handlers::HandlersConfig,
    observability::{ObservabilityConfig, RetentionConfig},
    observation_source::ObservationSourceConfig,
    pipeline::PipelineConfig,
    schedule::ScheduleConfig,
    simulation::SimulationConfig,
    worker::WorkerConfig,
};

/// System configuration
///
/// 进程启动时构建一次，之后以只读方式传给各组件的构造函数。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub schedule: ScheduleConfig,
    pub pipeline: PipelineConfig,
    pub simulation: SimulationConfig,
    pub observation_source: ObservationSourceConfig,
    pub handlers: HandlersConfig,
    pub worker: WorkerConfig,
    pub retention: RetentionConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: SNOWCAST_, nested keys joined by `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/snowcast.toml", "snowcast.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        // e.g. SNOWCAST_SCHEDULE__MORNING_RUN_HOUR=5
        builder = builder.add_source(
            Environment::with_prefix("SNOWCAST")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("observation_source.variables")
                .with_list_parse_key("simulation.extra_runtime_args")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.broker.validate().context("队列配置验证失败")?;
        self.schedule.validate().context("调度配置验证失败")?;
        self.pipeline.validate().context("流水线配置验证失败")?;
        self.simulation.validate().context("模拟程序配置验证失败")?;
        self.observation_source
            .validate()
            .context("观测接口配置验证失败")?;
        self.handlers.validate().context("处理器注解验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.retention.validate().context("数据保留配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        // 任务在硬时限内未确认就会被重新投递，可见性超时必须更长
        let max_hard = self.handlers.max_hard_time_limit_seconds();
        if self.broker.visibility_timeout_seconds <= max_hard {
            return Err(anyhow::anyhow!(
                "可见性超时({}s)必须大于最长的处理器硬时限({}s)",
                self.broker.visibility_timeout_seconds,
                max_hard
            ));
        }

        Ok(())
    }
}
