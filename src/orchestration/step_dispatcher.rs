//! # Step Dispatcher
//!
//! Consumes one dispatch message and hands the step to the remote backend.
//!
//! ## Consume sequence
//!
//! 1. Drop messages whose step or execution is gone, whose step is no longer
//!    pending, or whose execution already finished
//! 2. Claim the step (`pending -> running`); losing the claim means another
//!    consumer has it, so the message is dropped
//! 3. Start the execution and record the current step
//! 4. First step only: pick a machine, take the profile lock, pin the tunnel
//! 5. Bind the step's account, collect its inputs, fire the dispatch
//!
//! If anything after the claim fails, the work done by this consume is undone (lock,
//! tunnel, step claim) before the error is returned. The caller decides between
//! retrying and failing the execution.

use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::lock_manager::ResourceLockManager;
use super::machine_selector::MachineSelector;
use super::upload_registry::UploadRegistry;
use crate::backend::{AutomationBackend, DispatchCommand};
use crate::database::{ExecutionStore, StoreError};
use crate::error::{OrchestratorError, Result};
use crate::logging::log_step_operation;
use crate::messaging::DispatchEnvelope;
use crate::models::{Execution, ScriptGraph, ScriptStep, StepExecution, TunnelAssignment};
use crate::state_machine::{ExecutionEvent, StepEvent, StepExecutionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Dispatched {
        step_id: String,
        machine_id: Uuid,
        tunnel: String,
    },
    /// Stale or duplicate delivery; ack without doing anything
    Dropped { reason: String },
}

impl ConsumeOutcome {
    fn dropped(reason: impl Into<String>) -> Self {
        Self::Dropped {
            reason: reason.into(),
        }
    }
}

/// Side effects of a consume that must be undone if it fails
#[derive(Debug, Default)]
struct ClaimProgress {
    locked_profile: Option<Uuid>,
    tunnel_set: bool,
}

pub struct StepDispatcher {
    store: Arc<dyn ExecutionStore>,
    backend: Arc<dyn AutomationBackend>,
    selector: MachineSelector,
    lock_manager: ResourceLockManager,
    uploads: Arc<UploadRegistry>,
}

impl std::fmt::Debug for StepDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDispatcher")
            .field("selector", &self.selector)
            .field("lock_manager", &self.lock_manager)
            .finish()
    }
}

impl StepDispatcher {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        backend: Arc<dyn AutomationBackend>,
        selector: MachineSelector,
        lock_manager: ResourceLockManager,
        uploads: Arc<UploadRegistry>,
    ) -> Self {
        Self {
            store,
            backend,
            selector,
            lock_manager,
            uploads,
        }
    }

    pub async fn consume(&self, envelope: &DispatchEnvelope) -> Result<ConsumeOutcome> {
        let message = &envelope.body;

        let Some(step) = self
            .store
            .get_step_execution(message.step_execution_id)
            .await?
        else {
            return Ok(ConsumeOutcome::dropped("step execution not found"));
        };
        if step.execution_id != message.execution_id {
            return Ok(ConsumeOutcome::dropped(
                "step execution belongs to another execution",
            ));
        }
        if step.status != StepExecutionState::Pending {
            debug!(
                execution_id = %message.execution_id,
                step_id = %message.step_id,
                status = %step.status,
                "🔁 DISPATCH: Duplicate delivery dropped"
            );
            return Ok(ConsumeOutcome::dropped(format!("step is {}", step.status)));
        }

        let Some(execution) = self.store.get_execution(message.execution_id).await? else {
            return Ok(ConsumeOutcome::dropped("execution not found"));
        };
        if execution.status.is_terminal() {
            return Ok(ConsumeOutcome::dropped(format!(
                "execution already {}",
                execution.status
            )));
        }

        let graph = self
            .store
            .load_script_graph(execution.script_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("Script", execution.script_id))?;
        let script_step = graph
            .step(&step.step_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("ScriptStep", &step.step_id))?;

        match self
            .store
            .apply_step_event(step.step_execution_id, StepEvent::Start)
            .await
        {
            Ok(outcome) if outcome.was_applied() => {}
            Ok(_) | Err(StoreError::Transition(_)) => {
                return Ok(ConsumeOutcome::dropped("step claimed by another consumer"));
            }
            Err(e) => return Err(e.into()),
        }

        let mut progress = ClaimProgress::default();
        match self
            .dispatch_claimed(&execution, &graph, &script_step, &step, &mut progress)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(
                    execution_id = %execution.execution_id,
                    step_id = %step.step_id,
                    retry_count = envelope.retry_count(),
                    error = %e,
                    "⚠️ DISPATCH: Step could not be dispatched, rolling back claim"
                );
                self.rollback(&execution, &step, progress).await;
                Err(e)
            }
        }
    }

    async fn dispatch_claimed(
        &self,
        execution: &Execution,
        graph: &ScriptGraph,
        script_step: &ScriptStep,
        step: &StepExecution,
        progress: &mut ClaimProgress,
    ) -> Result<ConsumeOutcome> {
        let execution_id = execution.execution_id;

        self.store
            .apply_execution_event(execution_id, ExecutionEvent::Start)
            .await?;
        self.store
            .set_current_step(execution_id, &step.step_id)
            .await?;

        let assignment = match execution.tunnel_assignment() {
            Some(assignment) => assignment,
            None => self.assign_machine(execution, progress).await?,
        };

        let account_ref = self.resolve_account(execution, script_step).await?;

        let mut inputs: Vec<String> = graph
            .predecessors(&step.step_id)
            .into_iter()
            .filter_map(|p| p.output_name.clone())
            .collect();
        inputs.extend(
            self.uploads
                .files_for_step(execution.user_id, &step.step_id)
                .await?,
        );

        let command = DispatchCommand {
            execution_id,
            step_id: step.step_id.clone(),
            account_ref,
            instructions: script_step.instructions.clone(),
            inputs,
            output_name: script_step.output_name.clone(),
        };

        self.backend
            .dispatch(&assignment.tunnel, command)
            .await
            .map_err(|e| OrchestratorError::backend(e.to_string()))?;

        log_step_operation(
            "dispatch",
            execution_id,
            &step.step_id,
            Some(step.step_order),
            "running",
            Some(&assignment.tunnel),
        );

        Ok(ConsumeOutcome::Dispatched {
            step_id: step.step_id.clone(),
            machine_id: assignment.machine_id,
            tunnel: assignment.tunnel,
        })
    }

    /// Pick a machine, lock the profile and pin the tunnel for the rest of the execution
    async fn assign_machine(
        &self,
        execution: &Execution,
        progress: &mut ClaimProgress,
    ) -> Result<TunnelAssignment> {
        let machines = self.store.list_machines().await?;
        let machine = self.selector.select(&machines, execution.profile_id)?;
        let tunnel = machine
            .tunnel_url
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(OrchestratorError::NoCandidate {
                profile_id: execution.profile_id,
            })?
            .to_string();

        if let Some(profile_id) = execution.profile_id {
            self.lock_manager
                .acquire(profile_id, machine.machine_id, execution.execution_id)
                .await?;
            progress.locked_profile = Some(profile_id);
        }

        let assignment = TunnelAssignment {
            tunnel,
            machine_id: machine.machine_id,
        };
        self.store
            .set_tunnel(execution.execution_id, Some(&assignment))
            .await?;
        progress.tunnel_set = true;

        Ok(assignment)
    }

    /// The step's sticky account, or the profile's account bound to the step now
    async fn resolve_account(
        &self,
        execution: &Execution,
        script_step: &ScriptStep,
    ) -> Result<Option<String>> {
        if let Some(bound) = &script_step.account_ref {
            return Ok(Some(bound.clone()));
        }
        let Some(profile_id) = execution.profile_id else {
            return Ok(None);
        };
        let Some(account_ref) = self
            .store
            .get_profile(profile_id)
            .await?
            .and_then(|p| p.account_ref)
        else {
            return Ok(None);
        };

        let bound = self
            .store
            .bind_step_account(execution.script_id, &script_step.step_id, &account_ref)
            .await?;
        Ok(Some(bound))
    }

    async fn rollback(&self, execution: &Execution, step: &StepExecution, progress: ClaimProgress) {
        let execution_id = execution.execution_id;

        if let Some(profile_id) = progress.locked_profile {
            if let Err(e) = self.lock_manager.release(profile_id, execution_id).await {
                error!(execution_id = %execution_id, error = %e, "❌ DISPATCH: Rollback failed to release lock");
            }
        }
        if progress.tunnel_set {
            if let Err(e) = self.store.set_tunnel(execution_id, None).await {
                error!(execution_id = %execution_id, error = %e, "❌ DISPATCH: Rollback failed to clear tunnel");
            }
        }
        if let Err(e) = self
            .store
            .apply_step_event(step.step_execution_id, StepEvent::Retry)
            .await
        {
            error!(
                execution_id = %execution_id,
                step_id = %step.step_id,
                error = %e,
                "❌ DISPATCH: Rollback failed to return step to pending"
            );
        }
    }
}
