//! Queue publish failures: every transport error is either retried through
//! redelivery or ends the execution, never leaving it running with nothing in flight.

mod common;

use std::time::Duration;

use common::TestOrchestrator;
use uuid::Uuid;

use script_orchestrator::backend::{BackendError, DispatchFailureSink};
use script_orchestrator::database::ExecutionStore;
use script_orchestrator::messaging::CompletionSignal;
use script_orchestrator::orchestration::MessageDisposition;
use script_orchestrator::{ExecutionState, OrchestratorError, StepExecutionState};

async fn execution_status(harness: &TestOrchestrator, execution_id: Uuid) -> ExecutionState {
    harness
        .store
        .get_execution(execution_id)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn test_submit_publish_failure_fails_execution_and_frees_slot() {
    let harness = TestOrchestrator::new().await;
    let user_id = Uuid::new_v4();
    harness.add_machine("m1", 0, vec![]);
    let script_id = harness.save_script(user_id, None, &["a"], &[]).await;

    harness
        .faults
        .fail_sends(&harness.queues().step_dispatch, 1);
    let err = harness.core.submit(script_id, user_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Messaging(_)));
    assert!(!err.is_permanent());

    let executions = harness.store.executions();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionState::Failed);

    // The failed execution no longer counts against the cap
    let retry = harness.core.submit(script_id, user_id).await.unwrap();
    assert_eq!(harness.dispatch_next().await, Some(MessageDisposition::Acked));
    assert_eq!(
        execution_status(&harness, retry.execution_id).await,
        ExecutionState::Running
    );
}

#[tokio::test]
async fn test_next_step_publish_failure_recovers_on_signal_redelivery() {
    let harness = TestOrchestrator::new().await;
    let user_id = Uuid::new_v4();
    let profile_id = harness.add_profile(None);
    harness.add_machine("m1", 0, vec![profile_id]);
    let script_id = harness
        .save_script(user_id, Some(profile_id), &["a", "b"], &[("a", "b")])
        .await;
    let execution_id = harness
        .core
        .submit(script_id, user_id)
        .await
        .unwrap()
        .execution_id;
    assert_eq!(harness.dispatch_next().await, Some(MessageDisposition::Acked));

    harness
        .faults
        .fail_sends(&harness.queues().step_dispatch, 1);
    assert_eq!(
        harness
            .signal(CompletionSignal::success(execution_id, "a"))
            .await,
        Some(MessageDisposition::Released)
    );

    // Nothing moved: the step stays running and the execution keeps its lock
    assert_eq!(
        execution_status(&harness, execution_id).await,
        ExecutionState::Running
    );
    let steps = harness.step_executions(execution_id).await;
    assert_eq!(steps[0].status, StepExecutionState::Running);
    assert_eq!(steps[1].status, StepExecutionState::Pending);
    let profile = harness.store.get_profile(profile_id).await.unwrap().unwrap();
    assert_eq!(profile.locked_by_execution_id, Some(execution_id));

    harness.expire_visibility().await;
    assert_eq!(
        harness.listener.process_next().await.unwrap(),
        Some(MessageDisposition::Acked)
    );
    assert_eq!(harness.dispatch_next().await, Some(MessageDisposition::Acked));
    assert_eq!(harness.backend.dispatched_step_ids(), vec!["a", "b"]);

    harness
        .signal(CompletionSignal::success(execution_id, "b"))
        .await;
    assert_eq!(
        execution_status(&harness, execution_id).await,
        ExecutionState::Completed
    );
}

#[tokio::test]
async fn test_failure_signal_republish_error_recovers_on_redelivery() {
    let harness = TestOrchestrator::new().await;
    let user_id = Uuid::new_v4();
    harness.add_machine("m1", 0, vec![]);
    let script_id = harness.save_script(user_id, None, &["a"], &[]).await;
    let execution_id = harness
        .core
        .submit(script_id, user_id)
        .await
        .unwrap()
        .execution_id;
    let dispatch_queue = harness.queues().step_dispatch.clone();
    harness.dispatch_next().await;

    harness.faults.fail_delayed_sends(&dispatch_queue, 1);
    assert_eq!(
        harness
            .signal(CompletionSignal::failure(execution_id, "a", "connection timed out"))
            .await,
        Some(MessageDisposition::Released)
    );
    let steps = harness.step_executions(execution_id).await;
    assert_eq!(steps[0].status, StepExecutionState::Running);
    assert_eq!(harness.queue.hidden_count(&dispatch_queue).await, 0);

    harness.expire_visibility().await;
    assert_eq!(
        harness.listener.process_next().await.unwrap(),
        Some(MessageDisposition::Acked)
    );
    assert_eq!(harness.queue.hidden_count(&dispatch_queue).await, 1);

    harness.queue.advance_time(Duration::from_secs(10)).await;
    assert_eq!(harness.dispatch_next().await, Some(MessageDisposition::Acked));
    assert_eq!(harness.backend.dispatched().len(), 2);
}

#[tokio::test]
async fn test_dispatch_error_republish_failure_leaves_message_for_redelivery() {
    let harness = TestOrchestrator::new().await;
    let user_id = Uuid::new_v4();
    harness.add_machine("m1", 0, vec![]);
    let script_id = harness.save_script(user_id, None, &["a"], &[]).await;
    let execution_id = harness
        .core
        .submit(script_id, user_id)
        .await
        .unwrap()
        .execution_id;

    harness
        .backend
        .fail_next_with(BackendError::unavailable("connection refused"));
    harness
        .faults
        .fail_delayed_sends(&harness.queues().step_dispatch, 1);
    assert_eq!(
        harness.dispatch_next().await,
        Some(MessageDisposition::Released)
    );
    let steps = harness.step_executions(execution_id).await;
    assert_eq!(steps[0].status, StepExecutionState::Pending);

    harness.expire_visibility().await;
    assert_eq!(harness.dispatch_next().await, Some(MessageDisposition::Acked));
    assert_eq!(harness.backend.dispatched_step_ids(), vec!["a"]);
    assert_eq!(
        execution_status(&harness, execution_id).await,
        ExecutionState::Running
    );
}

#[tokio::test]
async fn test_reported_dispatch_failure_is_retried() {
    let harness = TestOrchestrator::new().await;
    let user_id = Uuid::new_v4();
    harness.add_machine("m1", 0, vec![]);
    let script_id = harness.save_script(user_id, None, &["a"], &[]).await;
    let execution_id = harness
        .core
        .submit(script_id, user_id)
        .await
        .unwrap()
        .execution_id;
    harness.dispatch_next().await;

    harness
        .core
        .bridge()
        .report_dispatch_failure(execution_id, "a", "request timed out")
        .await;

    let steps = harness.step_executions(execution_id).await;
    assert_eq!(steps[0].status, StepExecutionState::Pending);
    assert_eq!(
        harness
            .queue
            .hidden_count(&harness.queues().step_dispatch)
            .await,
        1
    );
}

#[tokio::test]
async fn test_reported_dispatch_failure_without_retry_fails_execution() {
    let harness = TestOrchestrator::new().await;
    let user_id = Uuid::new_v4();
    let profile_id = harness.add_profile(None);
    harness.add_machine("m1", 0, vec![profile_id]);
    let script_id = harness
        .save_script(user_id, Some(profile_id), &["a"], &[])
        .await;
    let execution_id = harness
        .core
        .submit(script_id, user_id)
        .await
        .unwrap()
        .execution_id;
    harness.dispatch_next().await;

    harness
        .faults
        .fail_delayed_sends(&harness.queues().step_dispatch, 1);
    harness
        .core
        .bridge()
        .report_dispatch_failure(execution_id, "a", "request timed out")
        .await;

    let execution = harness
        .store
        .get_execution(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionState::Failed);
    assert!(execution
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("request timed out"));
    let steps = harness.step_executions(execution_id).await;
    assert_eq!(steps[0].status, StepExecutionState::Failed);

    let profile = harness.store.get_profile(profile_id).await.unwrap().unwrap();
    assert_eq!(profile.locked_by_execution_id, None);

    // The user can run again
    harness.core.submit(script_id, user_id).await.unwrap();
}
