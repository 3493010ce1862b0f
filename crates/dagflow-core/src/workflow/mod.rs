//! Workflow engine core: step registry, DAG validation, and durable execution.
//!
//! - `action` -- Step action trait, boxed wrapper, and closure adapter
//! - `definition` -- Step definitions, template errors, YAML templates
//! - `dag` -- Dependency graph validation and topological ordering
//! - `registry` -- Immutable template storage keyed by workflow name
//! - `context` -- Append-only context merging with size limits
//! - `retry` -- Failure classification by step policy
//! - `checkpoint` -- Instance store wrapper with logging and error mapping
//! - `executor` -- Fixed-point scheduler with parallel step dispatch
//! - `gateway` -- Human task resumption entry point

pub mod action;
pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod gateway;
pub mod registry;
pub mod retry;

#[cfg(test)]
mod scheduler_tests;
