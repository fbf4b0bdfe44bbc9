use super::{
    errors::{StateMachineError, StateMachineResult},
    events::ExecutionEvent,
    states::ExecutionState,
};

/// Transition table for executions
///
/// ```text
/// pending --start--> running --complete--> completed
///    |                  |
///    +------fail--------+--> failed
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionStateMachine;

impl ExecutionStateMachine {
    pub fn determine_target_state(
        current_state: ExecutionState,
        event: &ExecutionEvent,
    ) -> StateMachineResult<ExecutionState> {
        let target = match (current_state, event) {
            (ExecutionState::Pending, ExecutionEvent::Start) => ExecutionState::Running,

            (ExecutionState::Running, ExecutionEvent::Complete) => ExecutionState::Completed,

            (ExecutionState::Pending, ExecutionEvent::Fail(_)) => ExecutionState::Failed,
            (ExecutionState::Running, ExecutionEvent::Fail(_)) => ExecutionState::Failed,

            (from_state, _) => {
                return Err(StateMachineError::invalid_transition(
                    from_state,
                    event.event_type(),
                ))
            }
        };

        Ok(target)
    }

    /// Whether `event` applied to `current_state` is a no-op redelivery rather than an error.
    ///
    /// Starting an already running execution happens for every step after the first.
    pub fn is_idempotent(current_state: ExecutionState, event: &ExecutionEvent) -> bool {
        matches!(
            (current_state, event),
            (ExecutionState::Running, ExecutionEvent::Start)
                | (ExecutionState::Completed, ExecutionEvent::Complete)
                | (ExecutionState::Failed, ExecutionEvent::Fail(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_lifecycle() {
        assert_eq!(
            ExecutionStateMachine::determine_target_state(
                ExecutionState::Pending,
                &ExecutionEvent::Start
            )
            .unwrap(),
            ExecutionState::Running
        );
        assert_eq!(
            ExecutionStateMachine::determine_target_state(
                ExecutionState::Running,
                &ExecutionEvent::Complete
            )
            .unwrap(),
            ExecutionState::Completed
        );
        assert_eq!(
            ExecutionStateMachine::determine_target_state(
                ExecutionState::Pending,
                &ExecutionEvent::fail_with_error("dispatch failed")
            )
            .unwrap(),
            ExecutionState::Failed
        );
    }

    #[test]
    fn test_terminal_states_reject_events() {
        for state in [ExecutionState::Completed, ExecutionState::Failed] {
            assert!(
                ExecutionStateMachine::determine_target_state(state, &ExecutionEvent::Start)
                    .is_err()
            );
            assert!(ExecutionStateMachine::determine_target_state(
                state,
                &ExecutionEvent::fail_with_error("late")
            )
            .is_err());
        }
    }

    #[test]
    fn test_cannot_complete_pending_execution() {
        let err = ExecutionStateMachine::determine_target_state(
            ExecutionState::Pending,
            &ExecutionEvent::Complete,
        )
        .unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_idempotent_start() {
        assert!(ExecutionStateMachine::is_idempotent(
            ExecutionState::Running,
            &ExecutionEvent::Start
        ));
        assert!(!ExecutionStateMachine::is_idempotent(
            ExecutionState::Pending,
            &ExecutionEvent::Start
        ));
    }
}
