//! # Completion Bridge
//!
//! Inbound half of the step lifecycle. The remote backend reports each step's result
//! out of band; the bridge turns that report into state changes:
//!
//! ```text
//! success ──▶ next step pending? ──▶ enqueue it ──▶ step completed
//!         └─▶ last step ──▶ step completed ──▶ execution completed, lock released
//!
//! failure ──▶ permanent reason ──▶ step + execution failed, lock released
//!         └─▶ transient reason ──▶ republish with backoff, or dead-letter + fail
//! ```
//!
//! The dispatch worker and the HTTP backend share the retry path through
//! [`CompletionBridge::retry_dispatch`] and [`DispatchFailureSink`].
//!
//! Every entry point is safe under redelivery: a signal for a step that already
//! reached the reported state, or for rows that no longer exist, is ignored. Queue
//! errors are returned before any state changes, so the listener releases the signal
//! and its redelivery repeats the whole transition.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error_classifier::{classify_reason, ErrorCategory};
use super::lock_manager::ResourceLockManager;
use crate::backend::DispatchFailureSink;
use crate::database::{ExecutionStore, StoreError, TransitionOutcome};
use crate::error::Result;
use crate::logging::{log_execution_operation, log_step_operation};
use crate::messaging::{
    CompletionResult, CompletionSignal, DispatchEnvelope, DispatchMessage, DispatchPublisher,
    RetryOutcome,
};
use crate::models::{Execution, StepExecution};
use crate::state_machine::{ExecutionEvent, StepEvent, StepExecutionState};

const DEFAULT_FAILURE_REASON: &str = "remote step failed";

/// What a completion or failure report led to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Stale or out-of-order report; nothing changed
    Ignored { reason: String },
    /// The step already reached the reported state
    Duplicate,
    NextEnqueued { step_id: String },
    ExecutionCompleted,
    Retried { retry_count: u32, delay: Duration },
    ExecutionFailed { reason: String },
}

impl CompletionOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }
}

#[derive(Clone)]
pub struct CompletionBridge {
    store: Arc<dyn ExecutionStore>,
    publisher: DispatchPublisher,
    lock_manager: ResourceLockManager,
}

impl std::fmt::Debug for CompletionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionBridge")
            .field("publisher", &self.publisher)
            .field("lock_manager", &self.lock_manager)
            .finish()
    }
}

impl CompletionBridge {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        publisher: DispatchPublisher,
        lock_manager: ResourceLockManager,
    ) -> Self {
        Self {
            store,
            publisher,
            lock_manager,
        }
    }

    pub async fn handle_signal(&self, signal: &CompletionSignal) -> Result<CompletionOutcome> {
        match signal.result {
            CompletionResult::Success => {
                self.on_step_completed(signal.execution_id, &signal.step_id)
                    .await
            }
            CompletionResult::Failure => {
                let reason = signal.reason.as_deref().unwrap_or(DEFAULT_FAILURE_REASON);
                self.on_step_failed(signal.execution_id, &signal.step_id, reason)
                    .await
            }
        }
    }

    /// Mark the step completed and advance the execution.
    ///
    /// The next step is published before the step is marked completed, so a failed
    /// publish leaves the step running and a redelivered signal tries again.
    pub async fn on_step_completed(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<CompletionOutcome> {
        let Some((execution, step)) = self.load(execution_id, step_id).await? else {
            return Ok(CompletionOutcome::ignored("execution or step not found"));
        };

        let steps = self.store.list_step_executions(execution_id).await?;
        let next = steps.iter().find(|s| s.step_order == step.step_order + 1);

        if step.status == StepExecutionState::Completed {
            // Last step done but the execution never got marked: finish it now
            if next.is_none() && !execution.status.is_terminal() {
                return self.finish_execution(&execution).await;
            }
            debug!(
                execution_id = %execution_id,
                step_id = step_id,
                "🔁 COMPLETION: Step already completed"
            );
            return Ok(CompletionOutcome::Duplicate);
        }
        if execution.status.is_terminal() {
            return Ok(CompletionOutcome::ignored(format!(
                "execution already {}",
                execution.status
            )));
        }
        if step.status != StepExecutionState::Running {
            warn!(
                execution_id = %execution_id,
                step_id = step_id,
                status = %step.status,
                "⚠️ COMPLETION: Ignoring completion for step that is not running"
            );
            return Ok(CompletionOutcome::ignored(format!("step is {}", step.status)));
        }

        let enqueued = match next {
            Some(next) if next.status == StepExecutionState::Pending => {
                self.enqueue_next(&execution, next).await?;
                Some(next.step_id.clone())
            }
            _ => None,
        };

        match self
            .store
            .apply_step_event(step.step_execution_id, StepEvent::Complete)
            .await
        {
            Ok(TransitionOutcome::Applied { .. }) => {}
            Ok(TransitionOutcome::Unchanged(_)) => return Ok(CompletionOutcome::Duplicate),
            Err(StoreError::Transition(e)) => {
                warn!(
                    execution_id = %execution_id,
                    step_id = step_id,
                    error = %e,
                    "⚠️ COMPLETION: Step changed while completing"
                );
                return Ok(CompletionOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }

        log_step_operation(
            "complete",
            execution_id,
            step_id,
            Some(step.step_order),
            "completed",
            None,
        );

        match (next, enqueued) {
            (_, Some(step_id)) => Ok(CompletionOutcome::NextEnqueued { step_id }),
            (Some(next), None) => {
                warn!(
                    execution_id = %execution_id,
                    next_step = %next.step_id,
                    status = %next.status,
                    "⚠️ COMPLETION: Next step is not pending, not enqueuing"
                );
                Ok(CompletionOutcome::ignored(format!(
                    "next step {} is {}",
                    next.step_id, next.status
                )))
            }
            (None, None) => self.finish_execution(&execution).await,
        }
    }

    async fn finish_execution(&self, execution: &Execution) -> Result<CompletionOutcome> {
        self.store
            .apply_execution_event(execution.execution_id, ExecutionEvent::Complete)
            .await?;
        self.release_execution_lock(execution).await;
        log_execution_operation(
            "complete",
            execution.execution_id,
            Some(execution.script_id),
            "completed",
            None,
        );
        Ok(CompletionOutcome::ExecutionCompleted)
    }

    /// Classify a reported step failure and either fail the execution or retry the step
    pub async fn on_step_failed(
        &self,
        execution_id: Uuid,
        step_id: &str,
        reason: &str,
    ) -> Result<CompletionOutcome> {
        self.handle_failure(execution_id, step_id, reason, classify_reason(reason))
            .await
    }

    /// Transient failure of a dispatch message: republish with backoff, or route it
    /// to the dead-letter queue and fail the execution once the budget is spent.
    pub async fn retry_dispatch(
        &self,
        envelope: &DispatchEnvelope,
        reason: &str,
    ) -> Result<CompletionOutcome> {
        let execution_id = envelope.body.execution_id;
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(CompletionOutcome::ignored("execution not found"));
        };
        if execution.status.is_terminal() {
            return Ok(CompletionOutcome::ignored(format!(
                "execution already {}",
                execution.status
            )));
        }

        let outcome = self.publisher.retry_or_dead_letter(envelope, reason).await?;
        let total_retries = self.store.increment_execution_retry(execution_id).await?;
        let step = self
            .store
            .get_step_execution(envelope.body.step_execution_id)
            .await?;

        match outcome {
            RetryOutcome::Retried {
                retry_count, delay, ..
            } => {
                if let Some(step) = step.filter(|s| {
                    matches!(
                        s.status,
                        StepExecutionState::Running | StepExecutionState::Failed
                    )
                }) {
                    self.store
                        .apply_step_event(step.step_execution_id, StepEvent::Retry)
                        .await?;
                }
                info!(
                    execution_id = %execution_id,
                    step_id = %envelope.body.step_id,
                    retry_count = retry_count,
                    execution_retries = total_retries,
                    delay_seconds = delay.as_secs(),
                    "🔄 COMPLETION: Step scheduled for retry"
                );
                Ok(CompletionOutcome::Retried { retry_count, delay })
            }
            RetryOutcome::DeadLettered { failures, .. } => {
                let reason = format!("step {} failed after {failures} attempts: {reason}", envelope.body.step_id);
                self.fail_loaded(&execution, step.as_ref(), &reason).await
            }
        }
    }

    /// Fail the step (if given) and its execution, and release the execution's lock
    pub async fn fail_execution(
        &self,
        execution_id: Uuid,
        step_execution_id: Option<Uuid>,
        reason: &str,
    ) -> Result<CompletionOutcome> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(CompletionOutcome::ignored("execution not found"));
        };
        let step = match step_execution_id {
            Some(id) => self.store.get_step_execution(id).await?,
            None => None,
        };
        self.fail_loaded(&execution, step.as_ref(), reason).await
    }

    async fn handle_failure(
        &self,
        execution_id: Uuid,
        step_id: &str,
        reason: &str,
        category: ErrorCategory,
    ) -> Result<CompletionOutcome> {
        let Some((execution, step)) = self.load(execution_id, step_id).await? else {
            return Ok(CompletionOutcome::ignored("execution or step not found"));
        };

        if execution.status.is_terminal() {
            return Ok(CompletionOutcome::ignored(format!(
                "execution already {}",
                execution.status
            )));
        }
        if step.status != StepExecutionState::Running {
            debug!(
                execution_id = %execution_id,
                step_id = step_id,
                status = %step.status,
                "🔁 COMPLETION: Failure report for step that is not running"
            );
            return Ok(CompletionOutcome::ignored(format!("step is {}", step.status)));
        }

        warn!(
            execution_id = %execution_id,
            step_id = step_id,
            category = %category,
            reason = reason,
            "⚠️ COMPLETION: Step failed"
        );

        if category.is_permanent() {
            return self.fail_loaded(&execution, Some(&step), reason).await;
        }

        let envelope = DispatchEnvelope::with_retry_count(
            DispatchMessage {
                execution_id,
                step_execution_id: step.step_execution_id,
                step_id: step.step_id.clone(),
                step_order: step.step_order,
            },
            step.retry_count(),
        );
        self.retry_dispatch(&envelope, reason).await
    }

    async fn fail_loaded(
        &self,
        execution: &Execution,
        step: Option<&StepExecution>,
        reason: &str,
    ) -> Result<CompletionOutcome> {
        if let Some(step) = step.filter(|s| !s.status.is_terminal()) {
            match self
                .store
                .apply_step_event(step.step_execution_id, StepEvent::Fail(reason.to_string()))
                .await
            {
                Ok(_) => {}
                Err(StoreError::Transition(e)) => warn!(
                    step_execution_id = %step.step_execution_id,
                    error = %e,
                    "⚠️ COMPLETION: Could not mark step failed"
                ),
                Err(e) => return Err(e.into()),
            }
        }

        match self
            .store
            .apply_execution_event(
                execution.execution_id,
                ExecutionEvent::Fail(reason.to_string()),
            )
            .await
        {
            Ok(_) => {}
            Err(StoreError::Transition(e)) => warn!(
                execution_id = %execution.execution_id,
                error = %e,
                "⚠️ COMPLETION: Could not mark execution failed"
            ),
            Err(e) => return Err(e.into()),
        }

        self.release_execution_lock(execution).await;
        error!(
            execution_id = %execution.execution_id,
            script_id = %execution.script_id,
            reason = reason,
            "💥 EXECUTION: Failed"
        );

        Ok(CompletionOutcome::ExecutionFailed {
            reason: reason.to_string(),
        })
    }

    /// Publish the next step's dispatch message. A failure is a transport error for
    /// the caller to retry; nothing has changed state yet.
    async fn enqueue_next(&self, execution: &Execution, next: &StepExecution) -> Result<()> {
        let message = DispatchMessage {
            execution_id: execution.execution_id,
            step_execution_id: next.step_execution_id,
            step_id: next.step_id.clone(),
            step_order: next.step_order,
        };

        self.publisher.publish(message).await?;
        Ok(())
    }

    /// The lock is only released when the execution got far enough to hold it
    async fn release_execution_lock(&self, execution: &Execution) {
        let (Some(profile_id), Some(_)) = (execution.profile_id, execution.machine_id) else {
            return;
        };
        if let Err(e) = self
            .lock_manager
            .release(profile_id, execution.execution_id)
            .await
        {
            error!(
                execution_id = %execution.execution_id,
                profile_id = %profile_id,
                error = %e,
                "❌ LOCK: Failed to release profile lock"
            );
        }
    }

    async fn load(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<(Execution, StepExecution)>> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(None);
        };
        let Some(step) = self
            .store
            .find_step_execution(execution_id, step_id)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some((execution, step)))
    }
}

#[async_trait]
impl DispatchFailureSink for CompletionBridge {
    async fn report_dispatch_failure(&self, execution_id: Uuid, step_id: &str, reason: &str) {
        let Err(e) = self
            .handle_failure(execution_id, step_id, reason, ErrorCategory::Transport)
            .await
        else {
            return;
        };

        // No dispatch message and no completion signal exist for this step any more,
        // so an unhandled failure would leave the execution running forever
        error!(
            execution_id = %execution_id,
            step_id = step_id,
            error = %e,
            "❌ COMPLETION: Retry of failed dispatch not possible, failing execution"
        );
        let step_execution_id = match self.store.find_step_execution(execution_id, step_id).await {
            Ok(step) => step.map(|s| s.step_execution_id),
            Err(find_err) => {
                warn!(
                    execution_id = %execution_id,
                    step_id = step_id,
                    error = %find_err,
                    "⚠️ COMPLETION: Could not load step while failing execution"
                );
                None
            }
        };
        let reason = format!("{reason}; retry could not be scheduled: {e}");
        if let Err(fail_err) = self
            .fail_execution(execution_id, step_execution_id, &reason)
            .await
        {
            error!(
                execution_id = %execution_id,
                step_id = step_id,
                error = %fail_err,
                "❌ COMPLETION: Failed to record dispatch failure"
            );
        }
    }
}
