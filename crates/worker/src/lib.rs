pub mod handlers;
pub mod pool;
pub mod rate_limit;
pub mod registry;
pub mod runner;

pub use handlers::{
    CleanupHandler, FetchObservationsHandler, PipelineRunHandler, SimulationBatchHandler,
    StoreResultsHandler,
};
pub use pool::{WorkerPool, WorkerPoolBuilder};
pub use rate_limit::HandlerRateLimiter;
pub use registry::{HandlerRegistry, RegisteredHandler};
pub use runner::{BatchExecution, DockerLauncher, SimulationRunner};
