//! 调度端：定时触发与流水线协调
//!
//! - `cron_utils` - CRON 表达式匹配
//! - `scheduler` - 固定触发表，按分钟入队运行请求与清理任务
//! - `pipeline` - 流水线运行的状态机与阶段推进

pub mod cron_utils;
pub mod pipeline;
pub mod scheduler;

pub use cron_utils::CronScheduler;
pub use pipeline::{CoordinatorSettings, PipelineCoordinator};
pub use scheduler::{
    standard_entries, TriggerScheduler, CLEANUP_TRIGGER, EVENING_RUN_LABEL, MORNING_RUN_LABEL,
};
