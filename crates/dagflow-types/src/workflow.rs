//! Workflow runtime types for dagflow.
//!
//! Defines the mutable, persisted state of a workflow run: the
//! `WorkflowInstance` record, one `StepState` per template step, and the
//! status enums that drive scheduling. Step *definitions* carry executable
//! actions and therefore live in `dagflow-core`; everything here is plain
//! serializable data that an instance store can round-trip.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shared key/value data threaded through an instance's steps.
///
/// A `BTreeMap` keeps serialization order stable, so saving an unchanged
/// instance always produces identical bytes.
pub type ContextMap = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Failure policy
// ---------------------------------------------------------------------------

/// What the scheduler does when a step attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Re-run the step while `attempts <= max_retries`, then fail the instance.
    #[default]
    Retry,
    /// Swallow the failure and mark the step completed.
    Skip,
    /// Fail the whole instance immediately.
    Abort,
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Status of one step within one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    WaitingOnHuman,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::WaitingOnHuman => "waiting_on_human",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
        }
    }

    /// Completed and failed instances never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Failed)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepState
// ---------------------------------------------------------------------------

/// Mutable execution state of a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Current step status.
    pub status: StepStatus,
    /// Number of execution attempts so far (increments each time the step is dispatched).
    pub attempts: u32,
    /// Last failure message. Cleared on success, kept when a failure is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the latest attempt was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepState {
    /// A fresh step that has never been dispatched.
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

impl Default for StepState {
    fn default() -> Self {
        Self::pending()
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// One execution of a workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance ID, assigned at start.
    pub id: Uuid,
    /// Name of the registered template this instance runs.
    pub template_name: String,
    /// Append-only shared data. Keys are written at most once per run.
    pub context: ContextMap,
    /// Per-step state keyed by step name.
    pub steps: BTreeMap<String, StepState>,
    /// Overall instance status.
    pub status: InstanceStatus,
    /// Reason the instance failed, naming the step that caused it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance state last changed.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Create a running instance with every named step `Pending`.
    pub fn new<I, S>(template_name: impl Into<String>, step_names: I, context: ContextMap) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            template_name: template_name.into(),
            context,
            steps: step_names
                .into_iter()
                .map(|name| (name.into(), StepState::pending()))
                .collect(),
            status: InstanceStatus::Running,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a step's state by name.
    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.get(name)
    }

    /// Status of a step, if the step exists.
    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.steps.get(name).map(|s| s.status)
    }

    /// Names of all steps currently in `status`, in name order.
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, state)| state.status == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// True when every step has completed.
    pub fn all_steps_completed(&self) -> bool {
        self.steps
            .values()
            .all(|s| s.status == StepStatus::Completed)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
