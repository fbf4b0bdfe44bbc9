//! # Failure Classification
//!
//! Decides whether a step failure is worth retrying. Errors raised inside the
//! orchestrator are classified by variant; failure reasons reported by the remote
//! backend arrive as free text and are classified by well-known phrases.
//!
//! | Category    | Examples                                  | Retry |
//! |-------------|-------------------------------------------|-------|
//! | Validation  | empty script, cycle detected              | no    |
//! | Contention  | resource in use, concurrency limit        | no    |
//! | StaleState  | rows that no longer exist                 | no    |
//! | Transport   | queue, store or backend unavailable       | yes   |

use serde::{Deserialize, Serialize};

use crate::database::StoreError;
use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The script itself is unusable
    Validation,
    /// Another execution owns what this one needs
    Contention,
    /// The message refers to state that is gone
    StaleState,
    /// Infrastructure hiccup; may succeed later
    Transport,
}

impl ErrorCategory {
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Transport)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "Validation"),
            ErrorCategory::Contention => write!(f, "Contention"),
            ErrorCategory::StaleState => write!(f, "Stale State"),
            ErrorCategory::Transport => write!(f, "Transport"),
        }
    }
}

const VALIDATION_PHRASES: &[&str] = &["cycle detected", "no steps", "empty script"];
const CONTENTION_PHRASES: &[&str] = &["resource already in use", "resource in use"];

pub fn classify(error: &OrchestratorError) -> ErrorCategory {
    match error {
        OrchestratorError::EmptyScript { .. }
        | OrchestratorError::CycleDetected { .. }
        | OrchestratorError::InvalidGraph { .. }
        | OrchestratorError::Configuration(_)
        | OrchestratorError::Store(StoreError::Validation { .. }) => ErrorCategory::Validation,

        OrchestratorError::ResourceInUse { .. }
        | OrchestratorError::ConcurrencyLimit { .. }
        | OrchestratorError::Store(StoreError::ConcurrencyLimit { .. }) => {
            ErrorCategory::Contention
        }

        OrchestratorError::NotFound { .. }
        | OrchestratorError::Store(StoreError::NotFound { .. }) => ErrorCategory::StaleState,

        _ => ErrorCategory::Transport,
    }
}

/// Classify a free-text failure reason reported by the remote backend
pub fn classify_reason(reason: &str) -> ErrorCategory {
    let reason = reason.to_lowercase();
    if VALIDATION_PHRASES.iter().any(|p| reason.contains(p)) {
        ErrorCategory::Validation
    } else if CONTENTION_PHRASES.iter().any(|p| reason.contains(p)) {
        ErrorCategory::Contention
    } else {
        ErrorCategory::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_reason_classification() {
        assert_eq!(classify_reason("Cycle detected in graph"), ErrorCategory::Validation);
        assert_eq!(classify_reason("script has no steps"), ErrorCategory::Validation);
        assert_eq!(
            classify_reason("Resource already in use by machine m-1"),
            ErrorCategory::Contention
        );
        assert_eq!(classify_reason("connection reset by peer"), ErrorCategory::Transport);
        assert_eq!(classify_reason(""), ErrorCategory::Transport);
    }

    #[test]
    fn test_error_classification_matches_permanence() {
        let errors = vec![
            OrchestratorError::CycleDetected {
                unresolved: vec!["a".to_string()],
            },
            OrchestratorError::ResourceInUse {
                profile_id: Uuid::new_v4(),
                holder: Uuid::new_v4(),
            },
            OrchestratorError::not_found("StepExecution", Uuid::new_v4()),
            OrchestratorError::backend("timeout"),
            OrchestratorError::NoCandidate { profile_id: None },
        ];

        for error in &errors {
            assert_eq!(classify(error).is_permanent(), error.is_permanent(), "{error}");
        }
    }

    #[test]
    fn test_orchestrator_messages_classify_like_their_variants() {
        // Reasons built from our own error messages land in the same category
        let in_use = OrchestratorError::ResourceInUse {
            profile_id: Uuid::new_v4(),
            holder: Uuid::new_v4(),
        };
        assert_eq!(classify_reason(&in_use.to_string()), ErrorCategory::Contention);

        let empty = OrchestratorError::EmptyScript {
            script_id: Uuid::new_v4(),
        };
        assert_eq!(classify_reason(&empty.to_string()), ErrorCategory::Validation);
    }
}
