pub mod app_config;
pub mod broker;
pub mod database;
pub mod handlers;
pub mod observability;
pub mod observation_source;
pub mod pipeline;
pub mod schedule;
pub mod simulation;
pub mod worker;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use broker::{BrokerBackend, BrokerConfig, QUEUE_DATA_FETCH, QUEUE_MODELING, QUEUE_PIPELINE};
pub use database::DatabaseConfig;
pub use handlers::{HandlerAnnotation, HandlerLimits, HandlersConfig};
pub use observability::{ObservabilityConfig, RetentionConfig};
pub use observation_source::ObservationSourceConfig;
pub use pipeline::PipelineConfig;
pub use schedule::ScheduleConfig;
pub use simulation::{ExecutionMode, SimulationConfig};
pub use worker::WorkerConfig;
