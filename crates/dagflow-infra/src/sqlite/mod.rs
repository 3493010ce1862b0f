//! SQLite storage layer.
//!
//! Instance store backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod instance;
pub mod pool;
