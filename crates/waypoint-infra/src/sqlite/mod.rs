//! SQLite storage layer.
//!
//! State persistence backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod pool;
pub mod state;

pub use pool::DatabasePool;
pub use state::SqliteStateRepository;
