//! Instance store trait definition.
//!
//! Defines the persistence contract the scheduler relies on. The
//! infrastructure layer (dagflow-infra) implements this trait with SQLite;
//! `memory::InMemoryInstanceStore` implements it for tests and embedding.

use dagflow_types::error::RepositoryError;
use dagflow_types::workflow::{InstanceStatus, WorkflowInstance};
use uuid::Uuid;

/// Repository trait for workflow instance persistence.
///
/// Implementations must make `save` atomic per instance (no partial step
/// state is ever observable) and durable across process restarts: `load`
/// after a crash returns the state as of the last successful `save`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait InstanceStore: Send + Sync {
    /// Persist a brand-new instance. Returns its ID.
    ///
    /// Fails with `RepositoryError::Conflict` if the ID already exists.
    fn create(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<Uuid, RepositoryError>> + Send;

    /// Load an instance by ID. Returns `None` if it does not exist.
    fn load(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Atomically replace the stored state of an existing instance.
    ///
    /// Fails with `RepositoryError::NotFound` if the instance was never created.
    fn save(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List instances currently in `status`, oldest first (crash recovery).
    fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;
}
