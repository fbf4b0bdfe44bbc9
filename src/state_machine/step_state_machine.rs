use super::{
    errors::{StateMachineError, StateMachineResult},
    events::StepEvent,
    states::StepExecutionState,
};

/// Transition table for step executions
#[derive(Debug, Clone, Copy, Default)]
pub struct StepStateMachine;

impl StepStateMachine {
    pub fn determine_target_state(
        current_state: StepExecutionState,
        event: &StepEvent,
    ) -> StateMachineResult<StepExecutionState> {
        let target = match (current_state, event) {
            // Start transitions
            (StepExecutionState::Pending, StepEvent::Start) => StepExecutionState::Running,

            // Complete transitions
            (StepExecutionState::Running, StepEvent::Complete) => StepExecutionState::Completed,

            // Failure transitions
            (StepExecutionState::Running, StepEvent::Fail(_)) => StepExecutionState::Failed,
            (StepExecutionState::Pending, StepEvent::Fail(_)) => StepExecutionState::Failed,

            // Retry transitions (back to pending for a republished dispatch)
            (StepExecutionState::Running, StepEvent::Retry) => StepExecutionState::Pending,
            (StepExecutionState::Failed, StepEvent::Retry) => StepExecutionState::Pending,

            (from_state, _) => {
                return Err(StateMachineError::invalid_transition(
                    from_state,
                    event.event_type(),
                ))
            }
        };

        Ok(target)
    }

    /// Whether `event` applied to `current_state` is a duplicate of a transition that
    /// already happened.
    pub fn is_idempotent(current_state: StepExecutionState, event: &StepEvent) -> bool {
        matches!(
            (current_state, event),
            (StepExecutionState::Completed, StepEvent::Complete)
                | (StepExecutionState::Failed, StepEvent::Fail(_))
                | (StepExecutionState::Pending, StepEvent::Retry)
        )
    }
}
