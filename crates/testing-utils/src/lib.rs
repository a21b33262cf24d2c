//! # Snowcast Testing Utils
//!
//! 各 crate 集成测试共用的测试替身与数据构造工具：
//!
//! - **fakes** - 可编排的观测数据源与模拟程序启动器
//! - **handlers** - 按脚本返回结果的任务处理器
//! - **builders** - 任务、站点和观测批次的构造器
//! - **helpers** - 异步条件等待等通用工具
//!
//! ```toml
//! [dev-dependencies]
//! snowcast-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod fakes;
pub mod handlers;
pub mod helpers;

pub use builders::*;
pub use fakes::*;
pub use handlers::*;
pub use helpers::*;
