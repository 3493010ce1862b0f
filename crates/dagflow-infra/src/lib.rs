//! Infrastructure layer for dagflow.
//!
//! Contains implementations of the storage ports defined in `dagflow-core`
//! (a SQLite `InstanceStore`) and the loader for `engine.toml`.

pub mod config;
pub mod sqlite;
