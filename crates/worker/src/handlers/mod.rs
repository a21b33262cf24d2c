//! 流水线的五个任务处理器
//!
//! 处理器只做本阶段的工作并通过 [`PipelineProgress`](snowcast_core::PipelineProgress)
//! 上报，阶段推进和下一阶段的入队由协调器负责。

mod cleanup;
mod fetch;
mod pipeline_run;
mod simulation;
mod store_results;

pub use cleanup::CleanupHandler;
pub use fetch::FetchObservationsHandler;
pub use pipeline_run::PipelineRunHandler;
pub use simulation::SimulationBatchHandler;
pub use store_results::StoreResultsHandler;
