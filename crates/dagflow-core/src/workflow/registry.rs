//! Step registry: validated, immutable workflow templates keyed by name.
//!
//! Templates are registered once (normally at process startup) and then
//! shared read-only with every scheduling pass through `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::dag::topological_order;
use super::definition::{
    ActionCatalog, StepDefinition, TemplateProblem, TemplateSpec, WorkflowError,
};

// ---------------------------------------------------------------------------
// WorkflowTemplate
// ---------------------------------------------------------------------------

/// A validated set of step definitions.
///
/// Steps are stored in topological order, so iterating `steps()` always
/// visits a dependency before its dependents.
#[derive(Debug)]
pub struct WorkflowTemplate {
    name: String,
    steps: Vec<StepDefinition>,
    index: HashMap<String, usize>,
}

impl WorkflowTemplate {
    /// Validate `steps` and build a template.
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Result<Self, WorkflowError> {
        let name = name.into();
        let mut problems = Vec::new();
        if name.trim().is_empty() {
            problems.push(TemplateProblem::EmptyTemplateName);
        }

        let order = match topological_order(&steps) {
            Ok(order) => order,
            Err(mut graph_problems) => {
                problems.append(&mut graph_problems);
                Vec::new()
            }
        };
        if !problems.is_empty() {
            return Err(WorkflowError::InvalidTemplate {
                template: name,
                problems,
            });
        }

        let mut slots: Vec<Option<StepDefinition>> = steps.into_iter().map(Some).collect();
        let ordered: Vec<StepDefinition> = order
            .into_iter()
            .filter_map(|idx| slots[idx].take())
            .collect();
        let index = ordered
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        Ok(Self {
            name,
            steps: ordered,
            index,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step definitions in topological order.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Look up a step definition by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    /// Step names in topological order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepRegistry
// ---------------------------------------------------------------------------

/// Thread-safe registry of workflow templates.
#[derive(Debug, Default)]
pub struct StepRegistry {
    templates: DashMap<String, Arc<WorkflowTemplate>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `steps` and register them under `template_name`.
    ///
    /// Fails with `WorkflowError::InvalidTemplate` listing every problem
    /// found, including `AlreadyDefined` when the name is taken.
    pub fn define(
        &self,
        template_name: &str,
        steps: Vec<StepDefinition>,
    ) -> Result<Arc<WorkflowTemplate>, WorkflowError> {
        let template = Arc::new(WorkflowTemplate::new(template_name, steps)?);

        match self.templates.entry(template_name.to_string()) {
            Entry::Occupied(_) => Err(WorkflowError::InvalidTemplate {
                template: template_name.to_string(),
                problems: vec![TemplateProblem::AlreadyDefined],
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&template));
                tracing::info!(
                    template = template_name,
                    steps = template.steps().len(),
                    "registered workflow template"
                );
                Ok(template)
            }
        }
    }

    /// Bind a parsed YAML template against `catalog` and register it.
    pub fn define_spec(
        &self,
        spec: &TemplateSpec,
        catalog: &ActionCatalog,
    ) -> Result<Arc<WorkflowTemplate>, WorkflowError> {
        let steps = spec.bind(catalog)?;
        self.define(&spec.name, steps)
    }

    /// Fetch a registered template.
    pub fn get(&self, template_name: &str) -> Option<Arc<WorkflowTemplate>> {
        self.templates
            .get(template_name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Names of all registered templates, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
