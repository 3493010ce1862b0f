//! In-memory `InstanceStore` backed by a `DashMap`.
//!
//! Not durable: state is lost with the process. Used by tests and by hosts
//! that embed the engine without persistence.

use dagflow_types::error::RepositoryError;
use dagflow_types::workflow::{InstanceStatus, WorkflowInstance};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use super::instance::InstanceStore;

/// Instance store that keeps every instance in a concurrent hash map.
#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    instances: DashMap<Uuid, WorkflowInstance>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl InstanceStore for InMemoryInstanceStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<Uuid, RepositoryError> {
        match self.instances.entry(instance.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(instance.clone());
                Ok(instance.id)
            }
        }
    }

    async fn load(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.instances.get(id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        match self.instances.get_mut(&instance.id) {
            Some(mut entry) => {
                *entry = instance.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut found: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|i| i.created_at);
        Ok(found)
    }
}
