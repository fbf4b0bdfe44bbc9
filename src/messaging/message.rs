//! # Queue Wire Messages
//!
//! JSON payloads exchanged over the dispatch, dead-letter and completion queues.
//!
//! A dispatch envelope looks like:
//!
//! ```json
//! {
//!   "headers": { "x-retry-count": 1, "x-last-error": "connection refused" },
//!   "body": {
//!     "executionId": "…",
//!     "stepExecutionId": "…",
//!     "stepId": "step-a",
//!     "stepOrder": 0
//!   }
//! }
//! ```
//!
//! The dead-letter queue carries the same envelope.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Instruction to dispatch one step of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    pub execution_id: Uuid,
    pub step_execution_id: Uuid,
    pub step_id: String,
    pub step_order: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchHeaders {
    /// Number of times the message has been republished
    #[serde(rename = "x-retry-count", default)]
    pub retry_count: u32,
    #[serde(
        rename = "x-last-error",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    #[serde(default)]
    pub headers: DispatchHeaders,
    pub body: DispatchMessage,
}

impl DispatchEnvelope {
    pub fn new(body: DispatchMessage) -> Self {
        Self {
            headers: DispatchHeaders::default(),
            body,
        }
    }

    pub fn with_retry_count(body: DispatchMessage, retry_count: u32) -> Self {
        Self {
            headers: DispatchHeaders {
                retry_count,
                last_error: None,
            },
            body,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.headers.retry_count
    }

    /// The envelope to republish after a failure
    pub fn next_attempt(&self, reason: impl Into<String>) -> Self {
        Self {
            headers: DispatchHeaders {
                retry_count: self.headers.retry_count + 1,
                last_error: Some(reason.into()),
            },
            body: self.body.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionResult {
    Success,
    Failure,
}

impl fmt::Display for CompletionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Out-of-band result reported by the remote backend for one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSignal {
    pub execution_id: Uuid,
    pub step_id: String,
    pub result: CompletionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CompletionSignal {
    pub fn success(execution_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            result: CompletionResult::Success,
            reason: None,
        }
    }

    pub fn failure(execution_id: Uuid, step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            execution_id,
            step_id: step_id.into(),
            result: CompletionResult::Failure,
            reason: Some(reason.into()),
        }
    }
}
