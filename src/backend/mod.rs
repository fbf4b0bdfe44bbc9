//! # Remote Automation Backend
//!
//! Outbound half of the step lifecycle. The orchestrator hands each step to the
//! automation backend running behind the execution's tunnel and returns immediately;
//! the outcome arrives later as a [`CompletionSignal`](crate::messaging::CompletionSignal).
//!
//! Failures that happen after the hand-off (connection refused, request timeout) are
//! reported to a [`DispatchFailureSink`], which routes them into the same retry path
//! as a transient failure signal.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use http::HttpAutomationBackend;

/// Request body posted to the backend for one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchCommand {
    pub execution_id: Uuid,
    pub step_id: String,
    pub account_ref: Option<String>,
    pub instructions: String,
    /// Output names of predecessor steps, then uploaded file ids
    pub inputs: Vec<String>,
    pub output_name: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Invalid tunnel endpoint {tunnel}: {reason}")]
    InvalidEndpoint { tunnel: String, reason: String },

    #[error("Automation backend unavailable: {message}")]
    Unavailable { message: String },
}

impl BackendError {
    pub fn invalid_endpoint(tunnel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            tunnel: tunnel.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait AutomationBackend: Send + Sync {
    /// Hand `command` to the backend behind `tunnel` without waiting for the remote outcome.
    ///
    /// An `Err` means the command could not be issued at all.
    async fn dispatch(&self, tunnel: &str, command: DispatchCommand) -> Result<(), BackendError>;
}

/// Receives failures detected after a dispatch was handed off
#[async_trait]
pub trait DispatchFailureSink: Send + Sync {
    async fn report_dispatch_failure(&self, execution_id: Uuid, step_id: &str, reason: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_command_wire_format() {
        let execution_id = Uuid::new_v4();
        let command = DispatchCommand {
            execution_id,
            step_id: "login".to_string(),
            account_ref: Some("acct-7".to_string()),
            instructions: "Open the dashboard".to_string(),
            inputs: vec!["cookies.json".to_string()],
            output_name: None,
        };

        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["executionId"], json!(execution_id.to_string()));
        assert_eq!(value["stepId"], json!("login"));
        assert_eq!(value["accountRef"], json!("acct-7"));
        assert_eq!(value["inputs"], json!(["cookies.json"]));
        assert_eq!(value["outputName"], json!(null));
    }
}
