use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid transition from {from} on event {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Invalid state value: {0}")]
    InvalidState(String),

    #[error("Concurrent modification: expected {expected}, found {actual}")]
    ConcurrentModification { expected: String, actual: String },
}

impl StateMachineError {
    pub fn invalid_transition(from: impl ToString, event: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            event: event.into(),
        }
    }
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
