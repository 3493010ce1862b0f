//! Step actions: the executable half of an automated step.
//!
//! `StepAction` is the trait hosts implement. It uses RPITIT, so it cannot be
//! a trait object directly; `BoxStepAction` follows the same blanket-impl
//! pattern as the other boxed ports:
//! 1. Define an object-safe `StepActionDyn` trait with boxed futures
//! 2. Blanket-impl `StepActionDyn` for all `T: StepAction`
//! 3. `BoxStepAction` wraps `Arc<dyn StepActionDyn>` and delegates
//!
//! `action_fn` adapts a plain async closure.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dagflow_types::workflow::ContextMap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Output of a successful step: new context keys and their values.
pub type StepOutput = Map<String, Value>;

// ---------------------------------------------------------------------------
// ActionInput
// ---------------------------------------------------------------------------

/// Everything an action receives for one attempt.
#[derive(Debug, Clone)]
pub struct ActionInput {
    /// Instance being executed.
    pub instance_id: Uuid,
    /// Name of the step being executed.
    pub step: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Read-only snapshot of the shared context at dispatch time.
    pub context: ContextMap,
    /// Wall-clock deadline for this attempt, when the step has a timeout.
    pub deadline: Option<DateTime<Utc>>,
    /// Cancelled when the deadline passes. The attempt keeps being polled for
    /// a short grace period afterwards, so an action awaiting
    /// `cancellation.cancelled()` can clean up before it is dropped.
    pub cancellation: CancellationToken,
}

impl ActionInput {
    /// Raw context value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Deserialize the context value at `key` into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, ActionError> {
        let value = self
            .context
            .get(key)
            .ok_or_else(|| ActionError::Failed(format!("context key '{key}' is missing")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| ActionError::Failed(format!("context key '{key}' has wrong shape: {e}")))
    }

    /// True once the attempt's deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// ActionError
// ---------------------------------------------------------------------------

/// Errors an action can return.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The action ran and failed.
    #[error("{0}")]
    Failed(String),

    /// The action gave up because its deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ActionError::Failed(message.into())
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        ActionError::Failed(format!("{err:#}"))
    }
}

// ---------------------------------------------------------------------------
// StepAction
// ---------------------------------------------------------------------------

/// An executable unit of work bound to an automated step.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StepAction: Send + Sync {
    fn run(
        &self,
        input: ActionInput,
    ) -> impl Future<Output = Result<StepOutput, ActionError>> + Send;
}

/// Object-safe version of [`StepAction`] with boxed futures.
pub trait StepActionDyn: Send + Sync {
    fn run_boxed(
        &self,
        input: ActionInput,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput, ActionError>> + Send + '_>>;
}

impl<T: StepAction> StepActionDyn for T {
    fn run_boxed(
        &self,
        input: ActionInput,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput, ActionError>> + Send + '_>> {
        Box::pin(self.run(input))
    }
}

/// Type-erased, cheaply clonable step action.
#[derive(Clone)]
pub struct BoxStepAction {
    inner: Arc<dyn StepActionDyn>,
}

impl BoxStepAction {
    /// Wrap a concrete `StepAction`.
    pub fn new<T: StepAction + 'static>(action: T) -> Self {
        Self {
            inner: Arc::new(action),
        }
    }

    /// Run the action for one attempt.
    pub async fn run(&self, input: ActionInput) -> Result<StepOutput, ActionError> {
        self.inner.run_boxed(input).await
    }
}

impl fmt::Debug for BoxStepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxStepAction")
    }
}

// ---------------------------------------------------------------------------
// Closure adapter
// ---------------------------------------------------------------------------

/// `StepAction` implemented by an async closure.
pub struct FnAction<F> {
    f: F,
}

impl<F, Fut> StepAction for FnAction<F>
where
    F: Fn(ActionInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, ActionError>> + Send,
{
    fn run(
        &self,
        input: ActionInput,
    ) -> impl Future<Output = Result<StepOutput, ActionError>> + Send {
        (self.f)(input)
    }
}

/// Build a boxed action from an async closure.
///
/// ```
/// use dagflow_core::workflow::action::{action_fn, StepOutput};
/// use serde_json::json;
///
/// let action = action_fn(|input| async move {
///     let mut out = StepOutput::new();
///     out.insert(format!("{}_done", input.step), json!(true));
///     Ok(out)
/// });
/// # let _ = action;
/// ```
pub fn action_fn<F, Fut>(f: F) -> BoxStepAction
where
    F: Fn(ActionInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutput, ActionError>> + Send + 'static,
{
    BoxStepAction::new(FnAction { f })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
