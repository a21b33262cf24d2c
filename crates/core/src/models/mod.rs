//! # 数据模型
//!
//! 任务、流水线运行、气象站观测与模拟作业等核心数据结构。
//! 所有时间字段使用 `DateTime<Utc>`，状态字段使用枚举。
//!
//! ## 状态流转
//!
//! ```text
//! Task:        queued → running → succeeded
//!                         ↓
//!                      retrying → queued ...
//!                         ↓
//!                   failed_permanent
//!
//! PipelineRun: fetching → simulating → storing → completed
//!                 ↓            ↓           ↓
//!               failed       failed      failed
//! ```

pub mod outcome;
pub mod params;
pub mod pipeline_run;
pub mod schedule;
pub mod simulation;
pub mod station;
pub mod task;

pub use outcome::*;
pub use params::*;
pub use pipeline_run::*;
pub use schedule::*;
pub use simulation::*;
pub use station::*;
pub use task::*;
