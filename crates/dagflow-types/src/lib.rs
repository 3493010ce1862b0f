//! Shared domain types for dagflow.
//!
//! This crate contains the persisted data model of the workflow engine:
//! instance and step state, failure policies, engine configuration, and
//! the repository error type used by storage ports.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod workflow;
