//! Dependency graph validation and topological ordering.
//!
//! Uses `petgraph` to model step dependencies as a directed graph with an
//! edge from each dependency to its dependent. The topological order is
//! stable: among steps whose dependencies are satisfied, the one declared
//! first comes first. When the sort cannot finish, strongly connected
//! components name every step on each cycle so the registration error can
//! list them all.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::{StepDefinition, TemplateProblem};

/// Validate that `steps` form a DAG and return the step indices in
/// topological order (dependencies before dependents, ties broken by
/// declaration order).
///
/// Every problem found is reported, not just the first:
/// - empty or duplicate step names
/// - self-dependencies
/// - dependencies on steps that are not in `steps`
/// - cycles (one `TemplateProblem::Cycle` per strongly connected component)
pub fn topological_order(steps: &[StepDefinition]) -> Result<Vec<usize>, Vec<TemplateProblem>> {
    let mut problems = Vec::new();

    if steps.is_empty() {
        return Err(vec![TemplateProblem::NoSteps]);
    }

    // Map step names to indices; flag empties and duplicates
    let mut name_to_idx: HashMap<&str, usize> = HashMap::new();
    let mut reported_duplicates = HashSet::new();
    for (idx, step) in steps.iter().enumerate() {
        if step.name.is_empty() {
            problems.push(TemplateProblem::EmptyStepName);
            continue;
        }
        if name_to_idx.insert(step.name.as_str(), idx).is_some()
            && reported_duplicates.insert(step.name.as_str())
        {
            problems.push(TemplateProblem::DuplicateStep(step.name.clone()));
        }
    }

    // Build directed graph: edge from dependency -> dependent
    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<NodeIndex> = (0..steps.len()).map(|i| graph.add_node(i)).collect();

    for (idx, step) in steps.iter().enumerate() {
        let mut seen_deps = HashSet::new();
        for dep in &step.depends_on {
            if !seen_deps.insert(dep.as_str()) {
                continue;
            }
            if dep == &step.name {
                problems.push(TemplateProblem::SelfDependency(step.name.clone()));
                continue;
            }
            match name_to_idx.get(dep.as_str()) {
                Some(&from) => {
                    graph.add_edge(nodes[from], nodes[idx], ());
                }
                None => problems.push(TemplateProblem::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                }),
            }
        }
    }

    // Topological sort -- on failure, collect every cycle
    let order = match declaration_stable_order(&graph) {
        Some(sorted) => Some(sorted),
        None => {
            for component in tarjan_scc(&graph) {
                if component.len() > 1 {
                    let mut names: Vec<String> = component
                        .iter()
                        .map(|n| steps[graph[*n]].name.clone())
                        .collect();
                    names.sort();
                    problems.push(TemplateProblem::Cycle(names));
                }
            }
            None
        }
    };

    match order {
        Some(order) if problems.is_empty() => Ok(order),
        _ => Err(problems),
    }
}

/// Kahn's algorithm with a min-heap of declaration indices.
///
/// Returns `None` when a cycle leaves some nodes with unmet dependencies.
fn declaration_stable_order(graph: &DiGraph<usize, ()>) -> Option<Vec<usize>> {
    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|n| indegree[n.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(graph[node]);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            let remaining = &mut indegree[next.index()];
            *remaining -= 1;
            if *remaining == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    (order.len() == graph.node_count()).then_some(order)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
