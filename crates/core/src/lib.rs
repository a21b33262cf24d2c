pub mod backoff;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod traits;
pub mod workspace;

pub use backoff::{BackoffDecision, BackoffPolicy};
pub use catalog::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use errors::*;
pub use logging::init_tracing;
pub use traits::*;
pub use workspace::RunWorkspace;
