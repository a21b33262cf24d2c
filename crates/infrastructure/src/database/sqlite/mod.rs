pub mod sqlite_store;
pub mod sqlite_task_broker;

pub use sqlite_store::SqliteStore;
pub use sqlite_task_broker::SqliteTaskBroker;
