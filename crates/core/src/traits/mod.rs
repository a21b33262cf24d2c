pub mod message_queue;
pub mod observation_source;
pub mod pipeline;
pub mod repository;
pub mod simulation_launcher;
pub mod task_handler;

pub use message_queue::*;
pub use observation_source::*;
pub use pipeline::*;
pub use repository::*;
pub use simulation_launcher::*;
pub use task_handler::*;
