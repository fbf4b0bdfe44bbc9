//! # Graph Validator & Topological Sorter
//!
//! Turns a script's steps and edges into a linear execution order with Kahn's
//! algorithm. An edge `(source, target)` means `target` runs after `source`.
//!
//! - Ties between simultaneously ready steps go to the step created first
//! - Edges naming a step outside the script are dropped and logged
//! - A script without edges runs in creation order
//! - Steps left with unresolved dependencies mean the graph has a cycle

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::models::ScriptGraph;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph has no steps")]
    Empty,

    #[error("cycle detected; unresolved steps: {}", .unresolved.join(", "))]
    Cycle { unresolved: Vec<String> },
}

/// Adjacency list plus in-degree over a step set
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    adjacency: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
    edge_count: usize,
    dropped_edges: usize,
}

impl DependencyGraph {
    /// Build from step ids in creation order and `(source, target)` pairs.
    /// Repeated step ids keep their first position.
    pub fn build<'a>(
        step_ids: impl IntoIterator<Item = &'a str>,
        edges: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut nodes = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for id in step_ids {
            if !index.contains_key(id) {
                index.insert(id, nodes.len());
                nodes.push(id.to_string());
            }
        }

        let mut adjacency = vec![Vec::new(); nodes.len()];
        let mut in_degree = vec![0usize; nodes.len()];
        let mut edge_count = 0;
        let mut dropped_edges = 0;

        for (source, target) in edges {
            match (index.get(source), index.get(target)) {
                (Some(&s), Some(&t)) => {
                    adjacency[s].push(t);
                    in_degree[t] += 1;
                    edge_count += 1;
                }
                _ => {
                    warn!(
                        source = source,
                        target = target,
                        "⚠️ GRAPH: Dropping edge with endpoint outside the step set"
                    );
                    dropped_edges += 1;
                }
            }
        }

        Self {
            nodes,
            adjacency,
            in_degree,
            edge_count,
            dropped_edges,
        }
    }

    pub fn from_script(graph: &ScriptGraph) -> Self {
        Self::build(
            graph.steps.iter().map(|s| s.step_id.as_str()),
            graph
                .edges
                .iter()
                .map(|e| (e.source_step_id.as_str(), e.target_step_id.as_str())),
        )
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Edges kept after filtering
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn dropped_edges(&self) -> usize {
        self.dropped_edges
    }

    pub fn topological_order(&self) -> std::result::Result<Vec<String>, GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }
        if self.edge_count == 0 {
            return Ok(self.nodes.clone());
        }

        let mut in_degree = self.in_degree.clone();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &next in &self.adjacency[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < self.nodes.len() {
            let unresolved = in_degree
                .iter()
                .enumerate()
                .filter(|(_, degree)| **degree > 0)
                .map(|(i, _)| self.nodes[i].clone())
                .collect();
            return Err(GraphError::Cycle { unresolved });
        }

        Ok(order.into_iter().map(|i| self.nodes[i].clone()).collect())
    }

    pub fn validate(&self) -> std::result::Result<(), GraphError> {
        self.topological_order().map(|_| ())
    }
}

fn into_orchestrator_error(graph: &ScriptGraph, error: GraphError) -> OrchestratorError {
    match error {
        GraphError::Empty => OrchestratorError::EmptyScript {
            script_id: graph.script.script_id,
        },
        GraphError::Cycle { unresolved } => OrchestratorError::CycleDetected { unresolved },
    }
}

/// Reject empty or cyclic scripts
pub fn validate(graph: &ScriptGraph) -> Result<()> {
    DependencyGraph::from_script(graph)
        .validate()
        .map_err(|e| into_orchestrator_error(graph, e))
}

/// Execution order of a script's steps
pub fn sort(graph: &ScriptGraph) -> Result<Vec<String>> {
    let dependency_graph = DependencyGraph::from_script(graph);
    let order = dependency_graph
        .topological_order()
        .map_err(|e| into_orchestrator_error(graph, e))?;

    debug!(
        script_id = %graph.script.script_id,
        steps = order.len(),
        edges = dependency_graph.edge_count(),
        dropped_edges = dependency_graph.dropped_edges(),
        "🧭 GRAPH: Script sorted"
    );
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(steps: &[&str], edges: &[(&str, &str)]) -> std::result::Result<Vec<String>, GraphError> {
        DependencyGraph::build(steps.iter().copied(), edges.iter().copied()).topological_order()
    }

    #[test]
    fn test_linear_chain() {
        assert_eq!(
            order(&["c", "b", "a"], &[("a", "b"), ("b", "c")]).unwrap(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_ties_follow_creation_order() {
        // d depends on both b and a; a and b are ready together
        assert_eq!(
            order(&["b", "a", "d"], &[("a", "d"), ("b", "d")]).unwrap(),
            vec!["b", "a", "d"]
        );
        assert_eq!(
            order(&["x", "root", "y"], &[("root", "y")]).unwrap(),
            vec!["x", "root", "y"]
        );
    }

    #[test]
    fn test_no_edges_keeps_creation_order() {
        assert_eq!(order(&["s2", "s1", "s3"], &[]).unwrap(), vec!["s2", "s1", "s3"]);
    }

    #[test]
    fn test_dangling_edges_are_dropped() {
        let graph = DependencyGraph::build(["a", "b"], [("a", "ghost"), ("ghost", "b")]);
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.dropped_edges(), 2);
        assert_eq!(graph.topological_order().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        assert_eq!(
            order(&["a"], &[("a", "a")]),
            Err(GraphError::Cycle {
                unresolved: vec!["a".to_string()]
            })
        );
    }

    #[test]
    fn test_cycle_lists_only_unresolved_steps() {
        let err = order(&["start", "x", "y", "z"], &[("start", "x"), ("x", "y"), ("y", "x"), ("y", "z")])
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                unresolved: vec!["x".to_string(), "y".to_string(), "z".to_string()]
            }
        );
    }

    #[test]
    fn test_empty_graph() {
        assert_eq!(order(&[], &[]), Err(GraphError::Empty));
    }
}
