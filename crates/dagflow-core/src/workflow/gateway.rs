//! Human task gateway: the entry point for external decisions.
//!
//! Approval UIs and message handlers talk to the gateway rather than the
//! scheduler. Every call is checked against the step's current status, so a
//! duplicate approval fails with `StepNotWaiting` instead of changing state;
//! callers can treat that error as "already handled".

use std::sync::Arc;

use dagflow_types::workflow::{StepStatus, WorkflowInstance};
use uuid::Uuid;

use crate::repository::instance::InstanceStore;

use super::action::StepOutput;
use super::executor::{ExecutorError, HumanDecision, Scheduler};

/// Thin wrapper over `Scheduler::resolve_human_task`.
pub struct HumanTaskGateway<S: InstanceStore> {
    scheduler: Arc<Scheduler<S>>,
}

impl<S: InstanceStore> Clone for HumanTaskGateway<S> {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}

impl<S: InstanceStore> HumanTaskGateway<S> {
    pub fn new(scheduler: Arc<Scheduler<S>>) -> Self {
        Self { scheduler }
    }

    /// Mark `step` completed with `output` and continue the instance.
    pub async fn complete(
        &self,
        instance_id: Uuid,
        step: &str,
        output: StepOutput,
    ) -> Result<WorkflowInstance, ExecutorError> {
        self.scheduler.resume(instance_id, step, output).await
    }

    /// Reject `step`; its failure policy decides whether the task reopens,
    /// is skipped, or fails the instance.
    pub async fn reject(
        &self,
        instance_id: Uuid,
        step: &str,
        reason: impl Into<String>,
    ) -> Result<WorkflowInstance, ExecutorError> {
        self.scheduler
            .resolve_human_task(instance_id, step, HumanDecision::Reject(reason.into()))
            .await
    }

    /// Steps of the instance currently waiting on a human, in name order.
    pub async fn pending_tasks(&self, instance_id: Uuid) -> Result<Vec<String>, ExecutorError> {
        let instance = self.scheduler.instance(instance_id).await?;
        Ok(instance
            .steps_with_status(StepStatus::WaitingOnHuman)
            .into_iter()
            .map(str::to_string)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
