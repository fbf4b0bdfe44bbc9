use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::{ExecutionState, StepExecutionState};

/// One run of a script for one user. Retained for audit, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub script_id: Uuid,
    pub user_id: Uuid,
    pub status: ExecutionState,
    /// Step currently in flight
    pub current_step_id: Option<String>,
    /// Transport endpoint to the worker machine, fixed after the first step
    pub tunnel: Option<String>,
    pub machine_id: Option<Uuid>,
    pub profile_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn tunnel_assignment(&self) -> Option<TunnelAssignment> {
        match (&self.tunnel, self.machine_id) {
            (Some(tunnel), Some(machine_id)) => Some(TunnelAssignment {
                tunnel: tunnel.clone(),
                machine_id,
            }),
            _ => None,
        }
    }
}

/// One step's run within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_execution_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    /// Zero-based position in the sorted execution order
    pub step_order: i32,
    pub status: StepExecutionState,
    pub error_message: Option<String>,
    /// Times the step has been dispatched; bumped on every pending -> running
    pub attempts: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Prior failed deliveries, as carried in the `x-retry-count` header
    pub fn retry_count(&self) -> u32 {
        u32::try_from(self.attempts.saturating_sub(1)).unwrap_or(0)
    }
}

/// Rows created at submit time: one execution and one step execution per sorted step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExecution {
    pub script_id: Uuid,
    pub user_id: Uuid,
    pub profile_id: Option<Uuid>,
    /// Step ids in execution order
    pub sorted_step_ids: Vec<String>,
}

/// Machine and tunnel an execution is pinned to after its first step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelAssignment {
    pub tunnel: String,
    pub machine_id: Uuid,
}
