//! Engine configuration types for dagflow.
//!
//! `EngineConfig` represents the `engine.toml` file that tunes scheduler
//! limits. Every field has a default so a partial file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduler-wide settings.
///
/// Loaded from `~/.dagflow/engine.toml` by `dagflow-infra`. All fields have
/// sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to steps that do not declare their own (None = unbounded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_step_timeout_secs: Option<u64>,

    /// Maximum JSON-encoded size of a single step output.
    #[serde(default = "default_max_step_output_bytes")]
    pub max_step_output_bytes: usize,

    /// Maximum JSON-encoded size of an instance's whole context.
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,
}

fn default_max_step_output_bytes() -> usize {
    1_048_576
}

fn default_max_context_bytes() -> usize {
    10_485_760
}

impl EngineConfig {
    /// The default step timeout as a `Duration`, if configured.
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: None,
            max_step_output_bytes: default_max_step_output_bytes(),
            max_context_bytes: default_max_context_bytes(),
        }
    }
}
