//! Workflow scheduling core for dagflow.
//!
//! This crate holds the step registry, the dependency-graph scheduler, the
//! human task gateway, and the `InstanceStore` port that the infrastructure
//! layer implements. It depends only on `dagflow-types` -- never on
//! `dagflow-infra` or any database crate.

pub mod repository;
pub mod workflow;
