//! Failure classification for step attempts.
//!
//! Stateless: every decision is derived from the step's `FailurePolicy`, its
//! retry budget, and how many attempts have already been dispatched. The
//! scheduler calls into this module for action errors, timeouts, panics,
//! human rejections and interrupted attempts alike, so every failure path
//! follows the same rules.

use chrono::{DateTime, Utc};
use dagflow_types::workflow::{FailurePolicy, StepState, StepStatus};

use super::definition::StepDefinition;

/// Error recorded when an attempt outlives its timeout.
pub const STEP_TIMEOUT: &str = "step timeout";

/// Error recorded for attempts left `Running` by a crashed process.
pub const STEP_INTERRUPTED: &str = "step interrupted";

// ---------------------------------------------------------------------------
// FailureOutcome
// ---------------------------------------------------------------------------

/// What happens to a step after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `Pending`; the next pass dispatches it again.
    Requeue,
    /// Marked `Completed` with the error kept in `last_error`.
    Swallow,
    /// Marked `Failed`; the instance fails with it.
    Fail,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler for step failures.
///
/// No internal state: all logic lives in associated functions that take the
/// step's policy as parameters.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed.
    ///
    /// `attempts` counts dispatched attempts including the one that just
    /// failed, so a step with `max_retries = N` runs at most `N + 1` times.
    pub fn should_retry(max_retries: u32, attempts: u32) -> bool {
        attempts <= max_retries
    }

    /// Decide the outcome of a failed attempt.
    ///
    /// `retryable = false` marks failures that would repeat identically
    /// (context key collisions, oversized outputs): they never requeue, but
    /// `Skip` still swallows them.
    pub fn classify(
        policy: FailurePolicy,
        max_retries: u32,
        attempts: u32,
        retryable: bool,
    ) -> FailureOutcome {
        match policy {
            FailurePolicy::Skip => FailureOutcome::Swallow,
            FailurePolicy::Abort => FailureOutcome::Fail,
            FailurePolicy::Retry if retryable && Self::should_retry(max_retries, attempts) => {
                FailureOutcome::Requeue
            }
            FailurePolicy::Retry => FailureOutcome::Fail,
        }
    }

    /// Classify a failure of `step` and apply it to `state`.
    ///
    /// Does not touch the owning instance; the caller fails the instance
    /// when this returns `FailureOutcome::Fail`.
    pub fn apply_failure(
        step: &StepDefinition,
        state: &mut StepState,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let outcome = Self::classify(step.on_failure, step.max_retries, state.attempts, retryable);
        state.last_error = Some(error.to_string());

        match outcome {
            FailureOutcome::Requeue => {
                state.status = StepStatus::Pending;
                tracing::info!(
                    step = step.name.as_str(),
                    attempts = state.attempts,
                    max_retries = step.max_retries,
                    error,
                    "step failed, retrying"
                );
            }
            FailureOutcome::Swallow => {
                state.status = StepStatus::Completed;
                state.completed_at = Some(now);
                tracing::warn!(
                    step = step.name.as_str(),
                    attempts = state.attempts,
                    error,
                    "step failed, skipping"
                );
            }
            FailureOutcome::Fail => {
                state.status = StepStatus::Failed;
                tracing::warn!(
                    step = step.name.as_str(),
                    attempts = state.attempts,
                    policy = ?step.on_failure,
                    error,
                    "step failed"
                );
            }
        }

        outcome
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
