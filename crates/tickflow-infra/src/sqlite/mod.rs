//! SQLite storage layer.
//!
//! `StateStore` and `WorkQueue` implementations backed by SQLite with WAL
//! mode and split read/write connection pools.

pub mod pool;
pub mod queue;
pub mod store;

pub use pool::DatabasePool;
pub use queue::SqliteWorkQueue;
pub use store::SqliteStateStore;
