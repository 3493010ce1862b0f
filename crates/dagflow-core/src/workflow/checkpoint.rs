//! Durable checkpoint manager for workflow instance state.
//!
//! Wraps an `InstanceStore` with the handful of operations the scheduler
//! needs, logging every write and mapping storage failures into
//! `CheckpointError`. Every state transition is saved before the scheduler
//! moves on, so a crashed process resumes from the last saved pass.

use dagflow_types::error::RepositoryError;
use dagflow_types::workflow::{InstanceStatus, WorkflowInstance};
use uuid::Uuid;

use crate::repository::instance::InstanceStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists instance checkpoints through an `InstanceStore`.
///
/// Generic over `S: InstanceStore` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<S: InstanceStore> {
    store: S,
}

impl<S: InstanceStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist a newly started instance.
    pub async fn create(&self, instance: &WorkflowInstance) -> Result<Uuid, CheckpointError> {
        let id = self.store.create(instance).await?;
        tracing::debug!(
            instance_id = %id,
            template = instance.template_name.as_str(),
            "checkpointed new instance"
        );
        Ok(id)
    }

    pub async fn load(&self, id: Uuid) -> Result<Option<WorkflowInstance>, CheckpointError> {
        Ok(self.store.load(&id).await?)
    }

    /// Save the full instance state.
    pub async fn save(&self, instance: &WorkflowInstance) -> Result<(), CheckpointError> {
        self.store.save(instance).await?;
        tracing::debug!(
            instance_id = %instance.id,
            status = %instance.status,
            "checkpointed instance"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery helpers
    // -----------------------------------------------------------------------

    /// All non-terminal instances (`Running` then `Paused`), oldest first
    /// within each status.
    pub async fn list_resumable(&self) -> Result<Vec<WorkflowInstance>, CheckpointError> {
        let mut instances = self.store.list_by_status(InstanceStatus::Running).await?;
        instances.extend(self.store.list_by_status(InstanceStatus::Paused).await?);
        Ok(instances)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
