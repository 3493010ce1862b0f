//! Step definitions, template errors, and YAML template parsing.
//!
//! A workflow template is a list of `StepDefinition`s registered under a
//! name. Steps are either automated (carry a `BoxStepAction`) or human tasks
//! (no action; completed by an external signal). Templates can also be
//! written as YAML, parsed into a `TemplateSpec`, and bound to actions from
//! an `ActionCatalog`.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use dagflow_types::workflow::FailurePolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::action::BoxStepAction;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A single structural problem found while validating a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateProblem {
    /// The template name is empty.
    EmptyTemplateName,
    /// The template has no steps.
    NoSteps,
    /// A step has an empty name.
    EmptyStepName,
    /// Two steps share a name.
    DuplicateStep(String),
    /// A step depends on a step that is not part of the template.
    UnknownDependency { step: String, dependency: String },
    /// A step lists itself as a dependency.
    SelfDependency(String),
    /// These steps form a dependency cycle.
    Cycle(Vec<String>),
    /// A template with this name is already registered.
    AlreadyDefined,
}

impl TemplateProblem {
    /// Step names implicated by this problem.
    pub fn steps(&self) -> Vec<&str> {
        match self {
            TemplateProblem::DuplicateStep(step) | TemplateProblem::SelfDependency(step) => {
                vec![step.as_str()]
            }
            TemplateProblem::UnknownDependency { step, .. } => vec![step.as_str()],
            TemplateProblem::Cycle(steps) => steps.iter().map(String::as_str).collect(),
            TemplateProblem::EmptyTemplateName
            | TemplateProblem::NoSteps
            | TemplateProblem::EmptyStepName
            | TemplateProblem::AlreadyDefined => Vec::new(),
        }
    }
}

impl fmt::Display for TemplateProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateProblem::EmptyTemplateName => write!(f, "template name must not be empty"),
            TemplateProblem::NoSteps => write!(f, "template must have at least one step"),
            TemplateProblem::EmptyStepName => write!(f, "step name must not be empty"),
            TemplateProblem::DuplicateStep(step) => write!(f, "duplicate step '{step}'"),
            TemplateProblem::UnknownDependency { step, dependency } => {
                write!(f, "step '{step}' depends on unknown step '{dependency}'")
            }
            TemplateProblem::SelfDependency(step) => write!(f, "step '{step}' depends on itself"),
            TemplateProblem::Cycle(steps) => {
                write!(f, "cycle detected involving steps [{}]", steps.join(", "))
            }
            TemplateProblem::AlreadyDefined => write!(f, "template is already defined"),
        }
    }
}

/// Errors that can occur while defining or loading templates.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Template failed validation; every problem found is listed.
    #[error("invalid template '{}': {}", .template, join_problems(.problems))]
    InvalidTemplate {
        template: String,
        problems: Vec<TemplateProblem>,
    },

    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// A YAML step names an action that is not in the catalog.
    #[error("step '{step}' references unknown action '{action}'")]
    UnknownAction { step: String, action: String },

    /// A YAML step is neither a human task nor bound to an action.
    #[error("step '{0}' needs either an action or human_task: true")]
    MissingAction(String),
}

fn join_problems(problems: &[TemplateProblem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl WorkflowError {
    /// All step names implicated by an `InvalidTemplate` error, deduplicated.
    pub fn offending_steps(&self) -> Vec<&str> {
        match self {
            WorkflowError::InvalidTemplate { problems, .. } => {
                let mut steps: Vec<&str> = problems.iter().flat_map(|p| p.steps()).collect();
                steps.sort_unstable();
                steps.dedup();
                steps
            }
            WorkflowError::UnknownAction { step, .. } => vec![step.as_str()],
            WorkflowError::MissingAction(step) => vec![step.as_str()],
            WorkflowError::ParseError(_) => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// What a step does when dispatched.
#[derive(Debug, Clone)]
pub enum StepKind {
    /// Run an action against the shared context.
    Automated(BoxStepAction),
    /// Pause the instance until an external decision arrives.
    HumanTask,
}

/// Immutable definition of one step in a workflow template.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    /// Unique name within the template.
    pub name: String,
    /// Steps that must be `Completed` before this one may run.
    pub depends_on: Vec<String>,
    /// Automated action or human task.
    pub kind: StepKind,
    /// Automatic re-attempts allowed after a failure (Retry policy).
    pub max_retries: u32,
    /// Maximum duration of one attempt.
    pub timeout: Option<Duration>,
    /// How a failed attempt is handled.
    pub on_failure: FailurePolicy,
}

impl StepDefinition {
    /// An automated step with no dependencies, no retries, and no timeout.
    pub fn automated(name: impl Into<String>, action: BoxStepAction) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            kind: StepKind::Automated(action),
            max_retries: 0,
            timeout: None,
            on_failure: FailurePolicy::Retry,
        }
    }

    /// A human task with no dependencies.
    pub fn human_task(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            kind: StepKind::HumanTask,
            max_retries: 0,
            timeout: None,
            on_failure: FailurePolicy::Retry,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn is_human_task(&self) -> bool {
        matches!(self.kind, StepKind::HumanTask)
    }
}

// ---------------------------------------------------------------------------
// YAML templates
// ---------------------------------------------------------------------------

/// Serializable shape of a template, as written in YAML.
///
/// ```yaml
/// name: order-fulfilment
/// steps:
///   - name: charge
///     action: charge-card
///     max_retries: 2
///     timeout_secs: 30
///   - name: approve
///     human_task: true
///     depends_on: [charge]
///   - name: ship
///     action: ship-order
///     depends_on: [approve]
///     on_failure: abort
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Template name used for registration.
    pub name: String,
    /// Step specifications in any order.
    pub steps: Vec<StepSpec>,
}

/// One step in a YAML template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Human tasks carry no action.
    #[serde(default)]
    pub human_task: bool,
    /// Name of the action in the `ActionCatalog`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

/// Named actions that YAML templates can reference.
#[derive(Debug, Clone, Default)]
pub struct ActionCatalog {
    actions: HashMap<String, BoxStepAction>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under `name`, replacing any previous one.
    pub fn insert(&mut self, name: impl Into<String>, action: BoxStepAction) {
        self.actions.insert(name.into(), action);
    }

    pub fn with(mut self, name: impl Into<String>, action: BoxStepAction) -> Self {
        self.insert(name, action);
        self
    }

    pub fn get(&self, name: &str) -> Option<&BoxStepAction> {
        self.actions.get(name)
    }
}

/// Parse a YAML string into a `TemplateSpec`.
///
/// Only the document shape is checked here; graph validation happens when
/// the bound steps are registered.
pub fn parse_template_yaml(yaml: &str) -> Result<TemplateSpec, WorkflowError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Serialize a `TemplateSpec` to a YAML string.
pub fn serialize_template_yaml(spec: &TemplateSpec) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(spec).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

impl TemplateSpec {
    /// Resolve action names against `catalog`, producing step definitions.
    pub fn bind(&self, catalog: &ActionCatalog) -> Result<Vec<StepDefinition>, WorkflowError> {
        self.steps
            .iter()
            .map(|spec| -> Result<StepDefinition, WorkflowError> {
                let mut step = if spec.human_task {
                    StepDefinition::human_task(&spec.name)
                } else {
                    let action_name = spec
                        .action
                        .as_deref()
                        .ok_or_else(|| WorkflowError::MissingAction(spec.name.clone()))?;
                    let action = catalog.get(action_name).cloned().ok_or_else(|| {
                        WorkflowError::UnknownAction {
                            step: spec.name.clone(),
                            action: action_name.to_string(),
                        }
                    })?;
                    StepDefinition::automated(&spec.name, action)
                };
                step = step
                    .depends_on(spec.depends_on.iter().cloned())
                    .max_retries(spec.max_retries)
                    .on_failure(spec.on_failure);
                if let Some(secs) = spec.timeout_secs {
                    step = step.timeout(Duration::from_secs(secs));
                }
                Ok(step)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
