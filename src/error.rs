//! # Orchestrator Error Types
//!
//! Top-level error taxonomy. Each variant falls into one of four families that drive
//! retry decisions downstream:
//!
//! - **Validation**: empty script, cycle detected. Permanent, surfaced at submit.
//! - **Contention**: resource in use, per-user concurrency limit. Permanent for the
//!   orchestrator; an outer caller may try again later.
//! - **Transport**: queue, store, or remote backend unavailable. Transient.
//! - **Stale state**: a message refers to rows that no longer exist. Treated as a no-op.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::database::StoreError;
use crate::messaging::MessagingError;
use crate::state_machine::StateMachineError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Script has no steps: {script_id}")]
    EmptyScript { script_id: Uuid },

    #[error("Cycle detected in script graph; unresolved steps: {}", .unresolved.join(", "))]
    CycleDetected { unresolved: Vec<String> },

    #[error("Invalid script graph: {message}")]
    InvalidGraph { message: String },

    #[error("Resource already in use: profile {profile_id} is held by machine {holder}")]
    ResourceInUse { profile_id: Uuid, holder: Uuid },

    #[error("Concurrency limit reached for user {user_id}: {active} active execution(s), limit is {limit}")]
    ConcurrencyLimit {
        user_id: Uuid,
        active: usize,
        limit: usize,
    },

    #[error("No candidate machine available{}", .profile_id.map(|p| format!(" for profile {p}")).unwrap_or_default())]
    NoCandidate { profile_id: Option<Uuid> },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Remote backend error: {message}")]
    Backend { message: String },

    #[error(transparent)]
    StateTransition(#[from] StateMachineError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn invalid_graph(message: impl Into<String>) -> Self {
        Self::InvalidGraph {
            message: message.into(),
        }
    }

    /// Validation, contention and stale-state errors never succeed on an automatic retry.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::EmptyScript { .. }
            | Self::CycleDetected { .. }
            | Self::InvalidGraph { .. }
            | Self::ResourceInUse { .. }
            | Self::ConcurrencyLimit { .. }
            | Self::NotFound { .. }
            | Self::Configuration(_) => true,
            Self::Store(
                StoreError::ConcurrencyLimit { .. }
                | StoreError::NotFound { .. }
                | StoreError::Validation { .. },
            ) => true,
            _ => false,
        }
    }

    /// Stable machine-readable code recorded alongside error messages.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyScript { .. } => "EMPTY_SCRIPT",
            Self::CycleDetected { .. } => "CYCLE_DETECTED",
            Self::InvalidGraph { .. } => "INVALID_GRAPH",
            Self::ResourceInUse { .. } => "RESOURCE_IN_USE",
            Self::ConcurrencyLimit { .. } => "CONCURRENCY_LIMIT",
            Self::NoCandidate { .. } => "NO_CANDIDATE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Backend { .. } => "BACKEND_ERROR",
            Self::StateTransition(_) => "STATE_TRANSITION_ERROR",
            Self::Messaging(_) => "MESSAGING_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_and_contention_are_permanent() {
        assert!(OrchestratorError::EmptyScript {
            script_id: Uuid::new_v4()
        }
        .is_permanent());
        assert!(OrchestratorError::CycleDetected {
            unresolved: vec!["a".to_string()]
        }
        .is_permanent());
        assert!(OrchestratorError::ResourceInUse {
            profile_id: Uuid::new_v4(),
            holder: Uuid::new_v4()
        }
        .is_permanent());
    }

    #[test]
    fn test_transport_errors_are_transient() {
        assert!(!OrchestratorError::backend("connection refused").is_permanent());
        assert!(!OrchestratorError::NoCandidate { profile_id: None }.is_permanent());
        assert!(!OrchestratorError::Messaging(MessagingError::internal("boom")).is_permanent());
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::CycleDetected {
            unresolved: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Cycle detected in script graph; unresolved steps: a, b"
        );
        assert_eq!(err.error_code(), "CYCLE_DETECTED");

        let err = OrchestratorError::NoCandidate { profile_id: None };
        assert_eq!(err.to_string(), "No candidate machine available");
    }
}
