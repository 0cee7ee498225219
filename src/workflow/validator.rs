//! Admission checks for workflow definitions.
//!
//! A workflow never begins execution unless validation passes, and every
//! problem found is collected so the caller sees all of them at once, not
//! just the first.

use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::agents::registry::AgentRegistry;
use crate::workflow::types::WorkflowDefinition;

/// Outcome of validating one definition.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Validate a definition against the registry: step ids are unique, every
/// agent selector matches a registered agent, every dependency names an
/// existing step, and the dependency graph is acyclic. The strategy field is
/// enforced by the type system for typed submissions and re-checked during
/// request parsing for raw ones. The definition is never mutated.
pub fn validate(definition: &WorkflowDefinition, registry: &AgentRegistry) -> ValidationReport {
    let mut errors = Vec::new();

    let mut ids: HashSet<&str> = HashSet::new();
    for step in &definition.steps {
        if !ids.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
    }

    for step in &definition.steps {
        if registry.candidates(&step.agent_id).is_empty() {
            errors.push(format!(
                "step '{}' references unknown agent '{}'",
                step.id, step.agent_id
            ));
        }
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                errors.push(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ));
            }
        }
    }

    detect_cycles(definition, &mut errors);

    debug!(
        workflow_id = %definition.id,
        errors = errors.len(),
        "Validated workflow definition"
    );
    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

/// Depth-first search with an explicit recursion stack: a neighbor still on
/// the stack signals a cycle.
fn detect_cycles(definition: &WorkflowDefinition, errors: &mut Vec<String>) {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();

    for step in &definition.steps {
        indices
            .entry(step.id.as_str())
            .or_insert_with(|| graph.add_node(step.id.as_str()));
    }
    for step in &definition.steps {
        let Some(&to) = indices.get(step.id.as_str()) else {
            continue;
        };
        for dep in &step.dependencies {
            if let Some(&from) = indices.get(dep.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }

    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut on_stack: HashSet<NodeIndex> = HashSet::new();
    for node in graph.node_indices() {
        if !visited.contains(&node) {
            dfs(&graph, node, &mut visited, &mut on_stack, errors);
        }
    }
}

fn dfs(
    graph: &DiGraph<&str, ()>,
    node: NodeIndex,
    visited: &mut HashSet<NodeIndex>,
    on_stack: &mut HashSet<NodeIndex>,
    errors: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    on_stack.insert(node);
    for neighbor in graph.neighbors(node) {
        if on_stack.contains(&neighbor) {
            errors.push(format!(
                "dependency cycle detected involving step '{}'",
                graph[neighbor]
            ));
            on_stack.remove(&node);
            return true;
        }
        if !visited.contains(&neighbor) && dfs(graph, neighbor, visited, on_stack, errors) {
            on_stack.remove(&node);
            return true;
        }
    }
    on_stack.remove(&node);
    false
}
