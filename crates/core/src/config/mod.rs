//! 配置管理
//!
//! 所有配置集中在 [`AppConfig`] 中，按以下顺序合并：
//!
//! 1. 内置默认值
//! 2. TOML 配置文件（`--config` 指定，或 `config/snowcast.toml`）
//! 3. `SNOWCAST_` 前缀的环境变量，嵌套字段用 `__` 连接
//!
//! ```toml
//! [schedule]
//! morning_run_hour = 4
//! evening_run_hour = 16
//!
//! [broker.concurrency]
//! data_fetch = 4
//! modeling = 2
//! pipeline = 2
//!
//! [[handlers.annotations]]
//! name = "fetch.observations"
//! rate_limit_per_minute = 10
//! soft_time_limit_seconds = 240
//! hard_time_limit_seconds = 300
//! ```
//!
//! 加载完成后立即执行 `validate()`，之后配置不可变。

pub mod models;

pub use models::*;

#[cfg(test)]
mod tests;
