//! Append-only context propagation.
//!
//! Step outputs are merged into the instance's shared context here. A key
//! may be written once per run: an output that names an existing key is
//! rejected as a whole with `ContextError::KeyCollision`, and the context is
//! left exactly as it was. Size limits from `EngineConfig` bound single
//! outputs and the whole context.

use dagflow_types::config::EngineConfig;
use dagflow_types::workflow::ContextMap;

use super::action::StepOutput;

/// Errors raised while merging a step output into the context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The output tried to overwrite keys that already exist.
    #[error("context key collision: [{}]", .keys.join(", "))]
    KeyCollision { keys: Vec<String> },

    /// The output (or the resulting context) exceeds its size limit.
    #[error("output of {size} bytes exceeds limit of {max} bytes")]
    OutputTooLarge { size: usize, max: usize },
}

/// Size limits applied during a merge.
#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub max_output_bytes: usize,
    pub max_context_bytes: usize,
}

impl From<&EngineConfig> for ContextLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_output_bytes: config.max_step_output_bytes,
            max_context_bytes: config.max_context_bytes,
        }
    }
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Keys of `output` that already exist in `context`, sorted.
pub fn colliding_keys(context: &ContextMap, output: &StepOutput) -> Vec<String> {
    let mut keys: Vec<String> = output
        .keys()
        .filter(|k| context.contains_key(k.as_str()))
        .cloned()
        .collect();
    keys.sort();
    keys
}

/// Check that `output` can be merged without writing anything.
pub fn check_merge(
    context: &ContextMap,
    output: &StepOutput,
    limits: ContextLimits,
) -> Result<(), ContextError> {
    let collisions = colliding_keys(context, output);
    if !collisions.is_empty() {
        return Err(ContextError::KeyCollision { keys: collisions });
    }

    let output_size = encoded_len(output);
    if output_size > limits.max_output_bytes {
        return Err(ContextError::OutputTooLarge {
            size: output_size,
            max: limits.max_output_bytes,
        });
    }

    let projected = encoded_len(context) + output_size;
    if projected > limits.max_context_bytes {
        return Err(ContextError::OutputTooLarge {
            size: projected,
            max: limits.max_context_bytes,
        });
    }

    Ok(())
}

/// Merge `output` into `context` under new keys only.
///
/// All-or-nothing: on error the context is unchanged. Returns the keys that
/// were added.
pub fn merge_output(
    context: &mut ContextMap,
    output: StepOutput,
    limits: ContextLimits,
) -> Result<Vec<String>, ContextError> {
    check_merge(context, &output, limits)?;

    let mut added = Vec::with_capacity(output.len());
    for (key, value) in output {
        added.push(key.clone());
        context.insert(key, value);
    }
    Ok(added)
}

fn encoded_len<T: serde::Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
