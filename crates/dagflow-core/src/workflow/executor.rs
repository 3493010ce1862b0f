//! Workflow scheduler: fixed-point DAG execution with durable checkpointing.
//!
//! The `Scheduler` drives one instance at a time through repeated scheduling
//! passes. Each pass dispatches every ready step concurrently via
//! `tokio::JoinSet`, waits for all of them to settle, applies the results,
//! and checkpoints the instance. Passes repeat until nothing is ready.
//!
//! # Execution flow
//!
//! 1. Take the per-instance lock and load the instance from the store. Steps
//!    left `Running` with no live attempt (a crash, or a checkpoint that
//!    failed mid-pass) go through their failure policy as interrupted.
//! 2. Compute the ready set: `Pending` steps whose dependencies are all `Completed`.
//! 3. Empty ready set: settle the instance status (Completed / Paused / Failed /
//!    Running), save if anything changed, and return.
//! 4. Otherwise mark human tasks `WaitingOnHuman`, mark automated steps
//!    `Running`, checkpoint, and run the actions in parallel with their timeouts.
//! 5. Merge outputs into the context or route failures through the step's
//!    `FailurePolicy`, checkpoint again, and loop back to 2.
//!
//! Action errors, timeouts and panics are all classified as step failures;
//! the only errors returned to callers are protocol and storage errors.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dagflow_types::config::EngineConfig;
use dagflow_types::workflow::{ContextMap, InstanceStatus, StepStatus, WorkflowInstance};
use dashmap::{DashMap, DashSet};
use futures_util::FutureExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::instance::InstanceStore;

use super::action::{ActionError, ActionInput, BoxStepAction, StepOutput};
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{ContextError, ContextLimits, merge_output};
use super::definition::{StepDefinition, StepKind};
use super::registry::{StepRegistry, WorkflowTemplate};
use super::retry::{FailureOutcome, RetryHandler, STEP_INTERRUPTED, STEP_TIMEOUT};

/// How long an attempt may keep running after its cancellation token fires.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// HumanDecision
// ---------------------------------------------------------------------------

/// External verdict on a step that is `WaitingOnHuman`.
#[derive(Debug, Clone)]
pub enum HumanDecision {
    /// Complete the step, merging `output` into the context.
    Approve(StepOutput),
    /// Fail the step with this reason; its `FailurePolicy` decides what follows.
    Reject(String),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Fixed-point scheduler over registered workflow templates.
///
/// Generic over `S: InstanceStore` for storage flexibility. Passes for the
/// same instance are serialized by a per-instance async mutex; passes for
/// different instances share nothing and run fully in parallel.
pub struct Scheduler<S: InstanceStore> {
    registry: Arc<StepRegistry>,
    checkpoint: CheckpointManager<S>,
    config: EngineConfig,
    /// Per-instance pass locks, dropped once no caller holds or awaits them.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Attempts whose spawned task has not finished yet.
    live: Arc<DashSet<(Uuid, String)>>,
}

impl<S: InstanceStore> Scheduler<S> {
    /// Create a scheduler with the default `EngineConfig`.
    pub fn new(registry: Arc<StepRegistry>, store: S) -> Self {
        Self::with_config(registry, store, EngineConfig::default())
    }

    pub fn with_config(registry: Arc<StepRegistry>, store: S, config: EngineConfig) -> Self {
        Self {
            registry,
            checkpoint: CheckpointManager::new(store),
            config,
            locks: DashMap::new(),
            live: Arc::new(DashSet::new()),
        }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Access the underlying instance store.
    pub fn store(&self) -> &S {
        self.checkpoint.store()
    }

    /// Number of instances with a pass lock currently allocated.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Number of step attempts currently executing.
    pub fn live_attempts(&self) -> usize {
        self.live.len()
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Create an instance of `template_name`, persist it, and run it until
    /// it reaches a fixed point.
    pub async fn start(
        &self,
        template_name: &str,
        initial_context: ContextMap,
    ) -> Result<Uuid, ExecutorError> {
        let template = self.template(template_name)?;
        let instance =
            WorkflowInstance::new(template.name(), template.step_names(), initial_context);
        let instance_id = self.checkpoint.create(&instance).await?;

        tracing::info!(
            instance_id = %instance_id,
            template = template_name,
            steps = template.steps().len(),
            "starting workflow instance"
        );

        self.advance(instance_id).await?;
        Ok(instance_id)
    }

    /// Run scheduling passes for an instance until nothing more is ready.
    ///
    /// Idempotent: a redundant call leaves the persisted state untouched, and
    /// a call on a terminal instance just returns it.
    pub async fn advance(&self, instance_id: Uuid) -> Result<WorkflowInstance, ExecutorError> {
        let _lock = self.lock_instance(instance_id).await;
        let instance = self.load(instance_id).await?;
        if instance.is_terminal() {
            return Ok(instance);
        }
        let template = self.template(&instance.template_name)?;
        self.run_to_fixed_point(instance, &template).await
    }

    /// Complete a `WaitingOnHuman` step with `output`, then advance.
    pub async fn resume(
        &self,
        instance_id: Uuid,
        step: &str,
        output: StepOutput,
    ) -> Result<WorkflowInstance, ExecutorError> {
        self.resolve_human_task(instance_id, step, HumanDecision::Approve(output))
            .await
    }

    /// Apply a human decision to a `WaitingOnHuman` step, then advance.
    ///
    /// Protocol errors (`InstanceNotFound`, `UnknownStep`, `StepNotWaiting`,
    /// `InstanceTerminal`, `ContextKeyCollision`, `OutputRejected`) leave the
    /// instance unchanged.
    pub async fn resolve_human_task(
        &self,
        instance_id: Uuid,
        step: &str,
        decision: HumanDecision,
    ) -> Result<WorkflowInstance, ExecutorError> {
        let _lock = self.lock_instance(instance_id).await;
        let mut instance = self.load(instance_id).await?;
        let template = self.template(&instance.template_name)?;

        let unknown = || ExecutorError::UnknownStep {
            instance_id,
            step: step.to_string(),
        };
        let definition = template.step(step).ok_or_else(unknown)?;
        let status = instance.step_status(step).ok_or_else(unknown)?;
        if status != StepStatus::WaitingOnHuman {
            return Err(ExecutorError::StepNotWaiting {
                step: step.to_string(),
                status,
            });
        }
        // An aborted instance can still hold tasks that were waiting on a human
        if instance.is_terminal() {
            return Err(ExecutorError::InstanceTerminal {
                instance_id,
                status: instance.status,
            });
        }

        let before = instance.clone();
        let now = Utc::now();
        match decision {
            HumanDecision::Approve(output) => {
                merge_output(&mut instance.context, output, self.limits()).map_err(|err| {
                    match err {
                        ContextError::KeyCollision { keys } => ExecutorError::ContextKeyCollision {
                            step: step.to_string(),
                            keys,
                        },
                        source => ExecutorError::OutputRejected {
                            step: step.to_string(),
                            source,
                        },
                    }
                })?;
                if let Some(state) = instance.steps.get_mut(step) {
                    state.status = StepStatus::Completed;
                    state.last_error = None;
                    state.completed_at = Some(now);
                }
                tracing::info!(instance_id = %instance_id, step, "human task approved");
            }
            HumanDecision::Reject(reason) => {
                tracing::info!(
                    instance_id = %instance_id,
                    step,
                    reason = reason.as_str(),
                    "human task rejected"
                );
                fail_step(&mut instance, definition, &format!("rejected: {reason}"), true, now);
            }
        }
        if instance.status == InstanceStatus::Paused {
            instance.status = InstanceStatus::Running;
        }
        self.persist(&before, &mut instance).await?;

        if instance.is_terminal() {
            return Ok(instance);
        }
        self.run_to_fixed_point(instance, &template).await
    }

    /// Re-drive every non-terminal instance, typically after a restart.
    ///
    /// Steps left `Running` by a previous process are treated as interrupted
    /// attempts and routed through their failure policy before the instance
    /// is advanced. Attempts still executing in this process are left alone,
    /// so calling this while other passes are in flight is safe.
    pub async fn recover(&self) -> Result<Vec<WorkflowInstance>, ExecutorError> {
        let resumable = self.checkpoint.list_resumable().await?;
        tracing::info!(instances = resumable.len(), "recovering workflow instances");

        let mut recovered = Vec::with_capacity(resumable.len());
        for listed in resumable {
            let _lock = self.lock_instance(listed.id).await;
            let Some(instance) = self.checkpoint.load(listed.id).await? else {
                continue;
            };
            if instance.is_terminal() {
                continue;
            }
            let template = match self.template(&instance.template_name) {
                Ok(template) => template,
                Err(err) => {
                    tracing::warn!(
                        instance_id = %instance.id,
                        error = %err,
                        "cannot recover instance"
                    );
                    continue;
                }
            };

            recovered.push(self.run_to_fixed_point(instance, &template).await?);
        }
        Ok(recovered)
    }

    /// Current persisted state of an instance.
    pub async fn instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, ExecutorError> {
        self.load(instance_id).await
    }

    // -----------------------------------------------------------------------
    // Scheduling passes
    // -----------------------------------------------------------------------

    /// Pass loop. The caller holds the instance lock.
    async fn run_to_fixed_point(
        &self,
        mut instance: WorkflowInstance,
        template: &WorkflowTemplate,
    ) -> Result<WorkflowInstance, ExecutorError> {
        let before = instance.clone();
        self.reclaim_interrupted(&mut instance, template);
        self.persist(&before, &mut instance).await?;
        if instance.is_terminal() {
            return Ok(instance);
        }

        loop {
            let ready = ready_steps(&instance, template);
            if ready.is_empty() {
                let before = instance.clone();
                settle_status(&mut instance);
                self.persist(&before, &mut instance).await?;
                return Ok(instance);
            }

            tracing::debug!(
                instance_id = %instance.id,
                ready = ready.len(),
                "scheduling pass"
            );
            self.run_pass(&mut instance, &ready).await?;

            if instance.is_terminal() {
                return Ok(instance);
            }
        }
    }

    /// Dispatch `ready`, wait for every attempt to settle, apply the results.
    async fn run_pass(
        &self,
        instance: &mut WorkflowInstance,
        ready: &[&StepDefinition],
    ) -> Result<(), ExecutorError> {
        let before = instance.clone();
        let now = Utc::now();
        let mut dispatch = Vec::new();

        for &definition in ready {
            let Some(state) = instance.steps.get_mut(&definition.name) else {
                continue;
            };
            state.attempts += 1;
            state.started_at = Some(now);
            match &definition.kind {
                StepKind::HumanTask => {
                    state.status = StepStatus::WaitingOnHuman;
                    tracing::info!(
                        instance_id = %instance.id,
                        step = definition.name.as_str(),
                        "step waiting on human"
                    );
                }
                StepKind::Automated(action) => {
                    state.status = StepStatus::Running;
                    tracing::debug!(
                        instance_id = %instance.id,
                        step = definition.name.as_str(),
                        attempt = state.attempts,
                        "dispatching step"
                    );
                    dispatch.push((definition, action.clone(), state.attempts));
                }
            }
        }

        // Checkpoint dispatch so a crash leaves the attempts visible as Running
        self.persist(&before, instance).await?;
        if dispatch.is_empty() {
            return Ok(());
        }

        let dispatched = instance.clone();
        let mut in_flight: BTreeSet<&str> = BTreeSet::new();
        let mut join_set = JoinSet::new();
        for (definition, action, attempt) in dispatch {
            let timeout = definition
                .timeout
                .or_else(|| self.config.default_step_timeout());
            let input = ActionInput {
                instance_id: instance.id,
                step: definition.name.clone(),
                attempt,
                context: instance.context.clone(),
                deadline: timeout
                    .and_then(|t| chrono::Duration::from_std(t).ok())
                    .and_then(|t| now.checked_add_signed(t)),
                cancellation: CancellationToken::new(),
            };
            in_flight.insert(definition.name.as_str());
            let live = LiveAttempt::register(&self.live, instance.id, &definition.name);
            join_set.spawn(async move {
                let _live = live;
                run_attempt(action, input, timeout).await
            });
        }

        let mut settled = Vec::with_capacity(in_flight.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(settlement) => settled.push(settlement),
                Err(err) => tracing::error!(
                    instance_id = %instance.id,
                    error = %err,
                    "step task did not finish"
                ),
            }
        }

        // Apply in topological order so context merges are deterministic
        settled.sort_by_key(|s| ready.iter().position(|d| d.name == s.step));
        for settlement in settled {
            in_flight.remove(settlement.step.as_str());
            if let Some(&definition) = ready.iter().find(|d| d.name == settlement.step) {
                self.apply_settlement(instance, definition, settlement);
            }
        }
        let finished = Utc::now();
        for name in in_flight {
            if let Some(&definition) = ready.iter().find(|d| d.name == name) {
                fail_step(instance, definition, STEP_INTERRUPTED, true, finished);
            }
        }

        self.persist(&dispatched, instance).await
    }

    fn apply_settlement(
        &self,
        instance: &mut WorkflowInstance,
        definition: &StepDefinition,
        settlement: Settlement,
    ) {
        let (error, retryable) = match settlement.result {
            Ok(output) => match merge_output(&mut instance.context, output, self.limits()) {
                Ok(added) => {
                    if let Some(state) = instance.steps.get_mut(&definition.name) {
                        state.status = StepStatus::Completed;
                        state.last_error = None;
                        state.completed_at = Some(settlement.finished_at);
                        tracing::info!(
                            instance_id = %instance.id,
                            step = definition.name.as_str(),
                            attempts = state.attempts,
                            keys = added.len(),
                            "step completed"
                        );
                    }
                    return;
                }
                // A rejected output would be rejected again on retry
                Err(err) => (err.to_string(), false),
            },
            Err(error) => (error, true),
        };
        fail_step(instance, definition, &error, retryable, settlement.finished_at);
    }

    /// Fail `Running` steps that have no attempt executing in this process.
    ///
    /// The caller holds the instance lock, so such a step was left behind by
    /// a crash or by a pass whose final checkpoint did not reach the store.
    fn reclaim_interrupted(&self, instance: &mut WorkflowInstance, template: &WorkflowTemplate) {
        let instance_id = instance.id;
        let orphaned: Vec<String> = instance
            .steps_with_status(StepStatus::Running)
            .into_iter()
            .filter(|name| !self.live.contains(&(instance_id, (*name).to_string())))
            .map(str::to_string)
            .collect();
        if orphaned.is_empty() {
            return;
        }

        let now = Utc::now();
        for name in &orphaned {
            if let Some(definition) = template.step(name) {
                tracing::warn!(
                    instance_id = %instance_id,
                    step = name.as_str(),
                    "step interrupted"
                );
                fail_step(instance, definition, STEP_INTERRUPTED, true, now);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn lock_instance(&self, instance_id: Uuid) -> InstanceLock<'_> {
        let mutex = Arc::clone(self.locks.entry(instance_id).or_default().value());
        let guard = mutex.lock_owned().await;
        InstanceLock {
            locks: &self.locks,
            instance_id,
            guard: Some(guard),
        }
    }

    async fn load(&self, instance_id: Uuid) -> Result<WorkflowInstance, ExecutorError> {
        self.checkpoint
            .load(instance_id)
            .await?
            .ok_or(ExecutorError::InstanceNotFound(instance_id))
    }

    fn template(&self, name: &str) -> Result<Arc<WorkflowTemplate>, ExecutorError> {
        self.registry
            .get(name)
            .ok_or_else(|| ExecutorError::TemplateNotFound(name.to_string()))
    }

    fn limits(&self) -> ContextLimits {
        ContextLimits::from(&self.config)
    }

    /// Save `instance` if it differs from `before`.
    async fn persist(
        &self,
        before: &WorkflowInstance,
        instance: &mut WorkflowInstance,
    ) -> Result<(), ExecutorError> {
        if instance == before {
            return Ok(());
        }
        instance.updated_at = Utc::now();
        self.checkpoint.save(instance).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-instance lock
// ---------------------------------------------------------------------------

/// Held for the whole of one operation on an instance.
///
/// On drop the guard is released first, then the table entry is removed if
/// no other caller holds a clone of the mutex.
struct InstanceLock<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    instance_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.instance_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

// ---------------------------------------------------------------------------
// Attempt execution
// ---------------------------------------------------------------------------

/// Entry in the live-attempt set, removed when the spawned task drops it.
///
/// Dropped on completion and on abort alike, so the set only ever names
/// attempts whose future still exists.
struct LiveAttempt {
    live: Arc<DashSet<(Uuid, String)>>,
    key: (Uuid, String),
}

impl LiveAttempt {
    fn register(live: &Arc<DashSet<(Uuid, String)>>, instance_id: Uuid, step: &str) -> Self {
        let key = (instance_id, step.to_string());
        live.insert(key.clone());
        Self {
            live: Arc::clone(live),
            key,
        }
    }
}

impl Drop for LiveAttempt {
    fn drop(&mut self) {
        self.live.remove(&self.key);
    }
}

/// Result of one attempt, produced inside the spawned task.
struct Settlement {
    step: String,
    result: Result<StepOutput, String>,
    finished_at: DateTime<Utc>,
}

async fn run_attempt(
    action: BoxStepAction,
    input: ActionInput,
    timeout: Option<Duration>,
) -> Settlement {
    let step = input.step.clone();
    let cancellation = input.cancellation.clone();
    let mut attempt = std::pin::pin!(AssertUnwindSafe(action.run(input)).catch_unwind());

    let caught = match timeout {
        Some(limit) => tokio::select! {
            caught = &mut attempt => caught,
            _ = tokio::time::sleep(limit) => {
                // Keep polling briefly so an action watching the token can wind down
                cancellation.cancel();
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut attempt).await;
                return Settlement {
                    step,
                    result: Err(STEP_TIMEOUT.to_string()),
                    finished_at: Utc::now(),
                };
            }
        },
        None => attempt.await,
    };

    let result = match caught {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(ActionError::DeadlineExceeded)) => Err(STEP_TIMEOUT.to_string()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(format!("action panicked: {}", panic_message(&*payload))),
    };
    Settlement {
        step,
        result,
        finished_at: Utc::now(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// State transitions
// ---------------------------------------------------------------------------

/// `Pending` steps whose dependencies are all `Completed`, in topological order.
fn ready_steps<'t>(
    instance: &WorkflowInstance,
    template: &'t WorkflowTemplate,
) -> Vec<&'t StepDefinition> {
    template
        .steps()
        .iter()
        .filter(|definition| {
            instance.step_status(&definition.name) == Some(StepStatus::Pending)
                && definition
                    .depends_on
                    .iter()
                    .all(|dep| instance.step_status(dep) == Some(StepStatus::Completed))
        })
        .collect()
}

/// Route a failed attempt through the step's policy, failing the instance
/// when the policy gives up.
fn fail_step(
    instance: &mut WorkflowInstance,
    definition: &StepDefinition,
    error: &str,
    retryable: bool,
    now: DateTime<Utc>,
) {
    let Some(state) = instance.steps.get_mut(&definition.name) else {
        return;
    };
    let outcome = RetryHandler::apply_failure(definition, state, error, retryable, now);
    if outcome == FailureOutcome::Fail {
        instance.status = InstanceStatus::Failed;
        if instance.error.is_none() {
            instance.error = Some(format!("step '{}' failed: {error}", definition.name));
        }
        tracing::warn!(
            instance_id = %instance.id,
            step = definition.name.as_str(),
            "workflow instance failed"
        );
    }
}

/// Status of an instance with an empty ready set.
fn settle_status(instance: &mut WorkflowInstance) {
    let any = |status: StepStatus| instance.steps.values().any(|s| s.status == status);
    let next = if instance.all_steps_completed() {
        InstanceStatus::Completed
    } else if any(StepStatus::WaitingOnHuman) {
        InstanceStatus::Paused
    } else if any(StepStatus::Failed) {
        InstanceStatus::Failed
    } else {
        InstanceStatus::Running
    };

    if next != instance.status {
        tracing::info!(
            instance_id = %instance.id,
            from = %instance.status,
            to = %next,
            "workflow instance status changed"
        );
        instance.status = next;
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors returned by scheduler operations.
///
/// Step failures never appear here; they are recorded on the instance.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// No instance with this ID exists in the store.
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// The instance references a template that is not registered.
    #[error("workflow template not found: {0}")]
    TemplateNotFound(String),

    /// The step name is not part of the instance's template.
    #[error("unknown step '{step}' in instance {instance_id}")]
    UnknownStep { instance_id: Uuid, step: String },

    /// The step exists but is not waiting on a human decision.
    #[error("step '{step}' is not waiting on a human task (status: {status})")]
    StepNotWaiting { step: String, status: StepStatus },

    /// The instance already completed or failed.
    #[error("workflow instance {instance_id} is already {status}")]
    InstanceTerminal {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    /// The supplied output tried to overwrite existing context keys.
    #[error("output of step '{step}' collides with context keys [{}]", .keys.join(", "))]
    ContextKeyCollision { step: String, keys: Vec<String> },

    /// The supplied output was rejected by the context size limits.
    #[error("output of step '{step}' rejected: {source}")]
    OutputRejected {
        step: String,
        #[source]
        source: ContextError,
    },

    /// Instance store failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
