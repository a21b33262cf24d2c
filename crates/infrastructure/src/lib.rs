pub mod cleanup_service;
pub mod database;
pub mod in_memory_queue;
pub mod memory_store;
pub mod mesowest;

pub use cleanup_service::{CleanupService, CleanupStats};
pub use database::{DatabaseManager, SqliteStore, SqliteTaskBroker};
pub use in_memory_queue::InMemoryTaskBroker;
pub use memory_store::InMemoryStore;
pub use mesowest::MesoWestClient;
