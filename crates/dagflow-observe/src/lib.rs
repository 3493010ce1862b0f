//! Observability setup for processes that host the dagflow scheduler.
//!
//! The engine crates only emit `tracing` events and spans; this crate
//! installs the subscriber that formats and exports them.

pub mod tracing_setup;
