//! # Script Submission
//!
//! Entry point for running a script: validate and sort its graph, create the
//! execution with one step row per sorted step, and enqueue the first step.
//! Returns as soon as the first dispatch message is on the queue.
//!
//! The per-user concurrency check and row creation happen in one store operation,
//! so two simultaneous submits by the same user cannot both pass the cap.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::graph;
use crate::database::{ExecutionStore, StoreError};
use crate::error::{OrchestratorError, Result};
use crate::messaging::{DispatchMessage, DispatchPublisher};
use crate::models::NewExecution;
use crate::state_machine::{ExecutionEvent, ExecutionState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub execution_id: Uuid,
    pub status: ExecutionState,
    pub step_count: usize,
}

pub struct ScriptSubmitter {
    store: Arc<dyn ExecutionStore>,
    publisher: DispatchPublisher,
    max_active_per_user: usize,
}

impl std::fmt::Debug for ScriptSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptSubmitter")
            .field("max_active_per_user", &self.max_active_per_user)
            .finish()
    }
}

impl ScriptSubmitter {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        publisher: DispatchPublisher,
        max_active_per_user: usize,
    ) -> Self {
        Self {
            store,
            publisher,
            max_active_per_user,
        }
    }

    #[instrument(skip(self))]
    pub async fn submit(&self, script_id: Uuid, user_id: Uuid) -> Result<SubmissionResult> {
        let script_graph = self
            .store
            .load_script_graph(script_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("Script", script_id))?;

        let sorted_step_ids = graph::sort(&script_graph)?;

        let new_execution = NewExecution {
            script_id,
            user_id,
            profile_id: script_graph.script.profile_id,
            sorted_step_ids,
        };

        let (execution, step_executions) = self
            .store
            .create_execution(&new_execution, self.max_active_per_user)
            .await
            .map_err(|e| match e {
                StoreError::ConcurrencyLimit {
                    user_id,
                    active,
                    limit,
                } => OrchestratorError::ConcurrencyLimit {
                    user_id,
                    active,
                    limit,
                },
                other => other.into(),
            })?;

        let first = step_executions
            .first()
            .ok_or(OrchestratorError::EmptyScript { script_id })?;

        let message = DispatchMessage {
            execution_id: execution.execution_id,
            step_execution_id: first.step_execution_id,
            step_id: first.step_id.clone(),
            step_order: first.step_order,
        };

        if let Err(e) = self.publisher.publish(message).await {
            error!(
                execution_id = %execution.execution_id,
                error = %e,
                "❌ SUBMIT: Failed to enqueue first step"
            );
            let reason = format!("failed to enqueue first step: {e}");
            if let Err(fail_err) = self
                .store
                .apply_execution_event(execution.execution_id, ExecutionEvent::Fail(reason))
                .await
            {
                error!(
                    execution_id = %execution.execution_id,
                    error = %fail_err,
                    "❌ SUBMIT: Failed to mark execution failed"
                );
            }
            return Err(e.into());
        }

        info!(
            execution_id = %execution.execution_id,
            script_id = %script_id,
            user_id = %user_id,
            steps = step_executions.len(),
            first_step = %first.step_id,
            "🚀 SUBMIT: Execution created"
        );

        Ok(SubmissionResult {
            execution_id: execution.execution_id,
            status: execution.status,
            step_count: step_executions.len(),
        })
    }
}
