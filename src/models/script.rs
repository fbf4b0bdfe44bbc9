//! # Scripts, Steps and Edges
//!
//! A script is a user-owned graph of steps. Step and edge identifiers are supplied by
//! the caller and stay stable across saves, which gives saves upsert semantics: steps
//! present in a save are inserted or updated, steps omitted are deleted.
//!
//! Each edge `(source, target)` means `target` depends on `source` completing first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub script_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub topic: Option<String>,
    /// Shared browser profile the steps operate against, if any
    pub profile_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A graph node: one unit of remote work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptStep {
    pub script_id: Uuid,
    pub step_id: String,
    pub name: String,
    pub output_name: Option<String>,
    pub instructions: String,
    /// External account binding, assigned lazily on first dispatch
    pub account_ref: Option<String>,
    /// Creation order within the script; used as the default execution order
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEdge {
    pub script_id: Uuid,
    pub edge_id: String,
    pub source_step_id: String,
    pub target_step_id: String,
}

/// A script together with its steps (in creation order) and edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptGraph {
    pub script: Script,
    pub steps: Vec<ScriptStep>,
    pub edges: Vec<StepEdge>,
}

impl ScriptGraph {
    pub fn step(&self, step_id: &str) -> Option<&ScriptStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Steps that `step_id` directly depends on, in edge order
    pub fn predecessors(&self, step_id: &str) -> Vec<&ScriptStep> {
        self.edges
            .iter()
            .filter(|e| e.target_step_id == step_id)
            .filter_map(|e| self.step(&e.source_step_id))
            .collect()
    }
}

/// Caller-supplied script contents for a save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    pub script_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub profile_id: Option<Uuid>,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_id: String,
    pub name: String,
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default)]
    pub instructions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub edge_id: String,
    pub source_step_id: String,
    pub target_step_id: String,
}

impl ScriptDefinition {
    /// Reject duplicate ids and edges whose endpoints are not steps of this script.
    pub fn validate_references(&self) -> Result<(), String> {
        let mut step_ids = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if step.step_id.is_empty() {
                return Err("Step id must not be empty".to_string());
            }
            if !step_ids.insert(step.step_id.as_str()) {
                return Err(format!("Duplicate step id: {}", step.step_id));
            }
        }

        let mut edge_ids = HashSet::with_capacity(self.edges.len());
        for edge in &self.edges {
            if !edge_ids.insert(edge.edge_id.as_str()) {
                return Err(format!("Duplicate edge id: {}", edge.edge_id));
            }
            for endpoint in [&edge.source_step_id, &edge.target_step_id] {
                if !step_ids.contains(endpoint.as_str()) {
                    return Err(format!(
                        "Edge {} references unknown step {}",
                        edge.edge_id, endpoint
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(edges: Vec<(&str, &str, &str)>) -> ScriptDefinition {
        ScriptDefinition {
            script_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "daily_post".to_string(),
            topic: None,
            profile_id: None,
            steps: ["a", "b"]
                .iter()
                .map(|id| StepDefinition {
                    step_id: id.to_string(),
                    name: id.to_uppercase(),
                    output_name: None,
                    instructions: String::new(),
                })
                .collect(),
            edges: edges
                .into_iter()
                .map(|(id, s, t)| EdgeDefinition {
                    edge_id: id.to_string(),
                    source_step_id: s.to_string(),
                    target_step_id: t.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_valid_references() {
        assert!(definition(vec![("e1", "a", "b")]).validate_references().is_ok());
    }

    #[test]
    fn test_edge_to_unknown_step_rejected() {
        let err = definition(vec![("e1", "a", "zzz")])
            .validate_references()
            .unwrap_err();
        assert!(err.contains("unknown step zzz"));
    }

    #[test]
    fn test_duplicate_edge_id_rejected() {
        assert!(definition(vec![("e1", "a", "b"), ("e1", "b", "a")])
            .validate_references()
            .is_err());
    }
}
