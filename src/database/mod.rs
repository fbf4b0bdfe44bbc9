//! # Execution State Store
//!
//! Durable state for scripts, executions, step executions, profile locks, machines and
//! upload associations.
//!
//! ## Backends
//!
//! - [`InMemoryExecutionStore`]: single-process store for tests and development
//! - [`PostgresExecutionStore`]: sqlx/PostgreSQL store with bundled migrations
//!
//! ## Atomicity
//!
//! Two operations must be atomic in every backend:
//!
//! - [`ExecutionStore::create_execution`] checks the per-user concurrency cap and
//!   creates the execution plus all step rows in one unit
//! - [`ExecutionStore::try_acquire_profile_lock`] is a compare-and-set on the
//!   profile's holder
//!
//! Status changes are conditional on the expected current status
//! (`transition_execution`, `transition_step`), so two consumers racing on the same
//! row cannot both win. The provided `apply_*_event` methods compute the target
//! state through the state machines and then perform that conditional update.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Execution, Machine, NewExecution, NewUploadAssociation, Profile, ScriptDefinition,
    ScriptGraph, StepExecution, TunnelAssignment, UploadAssociation,
};
use crate::state_machine::{
    ExecutionEvent, ExecutionState, ExecutionStateMachine, StateMachineError, StepEvent,
    StepExecutionState, StepStateMachine,
};

pub use memory::InMemoryExecutionStore;
pub use postgres::{PostgresExecutionStore, MIGRATOR};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Concurrency limit reached for user {user_id}: {active} active execution(s), limit is {limit}")]
    ConcurrencyLimit {
        user_id: Uuid,
        active: usize,
        limit: usize,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid script definition: {message}")]
    Validation { message: String },

    #[error("Invalid stored data: {message}")]
    InvalidData { message: String },

    #[error(transparent)]
    Transition(#[from] StateMachineError),

    #[error("Database error during {operation}: {message}")]
    Database { operation: String, message: String },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::database("query", "No rows found"),
            sqlx::Error::Database(db_err) => StoreError::database("database", db_err.to_string()),
            sqlx::Error::PoolTimedOut => StoreError::database("pool", "Connection pool timed out"),
            _ => StoreError::database("connection", err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::database("migrate", err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a compare-and-set on a profile's lock holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// The lock now belongs to the caller; `reclaimed_from` is set when an expired
    /// hold was taken over
    Acquired {
        acquired_at: DateTime<Utc>,
        reclaimed_from: Option<Uuid>,
    },
    /// Held by someone else within the expiry window
    Held {
        holder: Uuid,
        since: DateTime<Utc>,
    },
}

/// Holder state observed by a release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockRelease {
    pub previous_machine: Option<Uuid>,
    pub previous_execution: Option<Uuid>,
}

/// Outcome of applying a state machine event to a stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome<S> {
    Applied { from: S, to: S },
    /// The row was already in the state the event leads to
    Unchanged(S),
}

impl<S: Copy> TransitionOutcome<S> {
    pub fn state(&self) -> S {
        match self {
            Self::Applied { to, .. } => *to,
            Self::Unchanged(state) => *state,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // Scripts

    /// Upsert a script with its steps and edges; steps and edges omitted from the
    /// definition are deleted. Existing steps keep their creation position and
    /// account binding.
    async fn save_script(&self, definition: &ScriptDefinition) -> StoreResult<ScriptGraph>;

    async fn load_script_graph(&self, script_id: Uuid) -> StoreResult<Option<ScriptGraph>>;

    /// Bind `account_ref` to the step unless it already has one; returns the effective binding.
    async fn bind_step_account(
        &self,
        script_id: Uuid,
        step_id: &str,
        account_ref: &str,
    ) -> StoreResult<String>;

    // Executions

    /// Create an execution and its step rows, failing with
    /// [`StoreError::ConcurrencyLimit`] when the user already has `max_active`
    /// pending or running executions.
    async fn create_execution(
        &self,
        new_execution: &NewExecution,
        max_active: usize,
    ) -> StoreResult<(Execution, Vec<StepExecution>)>;

    async fn get_execution(&self, execution_id: Uuid) -> StoreResult<Option<Execution>>;

    async fn count_active_executions(&self, user_id: Uuid) -> StoreResult<usize>;

    /// Conditional status update; `false` when the row was not in `from`.
    /// Entering `running` stamps `started_at`, entering a terminal state stamps `completed_at`.
    async fn transition_execution(
        &self,
        execution_id: Uuid,
        from: ExecutionState,
        to: ExecutionState,
        error_message: Option<&str>,
    ) -> StoreResult<bool>;

    async fn set_current_step(&self, execution_id: Uuid, step_id: &str) -> StoreResult<()>;

    /// Record (or with `None`, clear) the machine and tunnel an execution runs on
    async fn set_tunnel(
        &self,
        execution_id: Uuid,
        assignment: Option<&TunnelAssignment>,
    ) -> StoreResult<()>;

    /// Returns the new retry count
    async fn increment_execution_retry(&self, execution_id: Uuid) -> StoreResult<i32>;

    // Step executions

    async fn get_step_execution(
        &self,
        step_execution_id: Uuid,
    ) -> StoreResult<Option<StepExecution>>;

    async fn find_step_execution(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> StoreResult<Option<StepExecution>>;

    /// All step rows of an execution ordered by `step_order`
    async fn list_step_executions(&self, execution_id: Uuid) -> StoreResult<Vec<StepExecution>>;

    /// Conditional status update; `false` when the row was not in `from`.
    /// Entering `running` stamps `started_at` and bumps `attempts`.
    async fn transition_step(
        &self,
        step_execution_id: Uuid,
        from: StepExecutionState,
        to: StepExecutionState,
        error_message: Option<&str>,
    ) -> StoreResult<bool>;

    // Profiles and machines

    async fn get_profile(&self, profile_id: Uuid) -> StoreResult<Option<Profile>>;

    /// Atomically take the profile lock if it is free or its hold is older than `expiry`
    async fn try_acquire_profile_lock(
        &self,
        profile_id: Uuid,
        machine_id: Uuid,
        execution_id: Uuid,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> StoreResult<LockAttempt>;

    /// Clear the holder and stamp `lock_released_at`, whoever holds it
    async fn release_profile_lock(
        &self,
        profile_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<LockRelease>;

    async fn list_machines(&self) -> StoreResult<Vec<Machine>>;

    // Uploads

    /// Insert or replace the association for `(user, step, slot)`
    async fn upsert_upload(
        &self,
        upload: &NewUploadAssociation,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<UploadAssociation>;

    /// Unexpired associations for a step, ordered by slot
    async fn list_uploads(
        &self,
        user_id: Uuid,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<UploadAssociation>>;

    // Provided

    /// Run an execution event through [`ExecutionStateMachine`] and persist the result.
    async fn apply_execution_event(
        &self,
        execution_id: Uuid,
        event: ExecutionEvent,
    ) -> StoreResult<TransitionOutcome<ExecutionState>> {
        let execution = self
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| StoreError::not_found("Execution", execution_id))?;

        let current = execution.status;
        if ExecutionStateMachine::is_idempotent(current, &event) {
            return Ok(TransitionOutcome::Unchanged(current));
        }

        let target = ExecutionStateMachine::determine_target_state(current, &event)?;
        if self
            .transition_execution(execution_id, current, target, event.error_message())
            .await?
        {
            Ok(TransitionOutcome::Applied {
                from: current,
                to: target,
            })
        } else {
            Err(StateMachineError::ConcurrentModification {
                expected: current.to_string(),
                actual: "changed".to_string(),
            }
            .into())
        }
    }

    /// Run a step event through [`StepStateMachine`] and persist the result.
    async fn apply_step_event(
        &self,
        step_execution_id: Uuid,
        event: StepEvent,
    ) -> StoreResult<TransitionOutcome<StepExecutionState>> {
        let step = self
            .get_step_execution(step_execution_id)
            .await?
            .ok_or_else(|| StoreError::not_found("StepExecution", step_execution_id))?;

        let current = step.status;
        if StepStateMachine::is_idempotent(current, &event) {
            return Ok(TransitionOutcome::Unchanged(current));
        }

        let target = StepStateMachine::determine_target_state(current, &event)?;
        if self
            .transition_step(step_execution_id, current, target, event.error_message())
            .await?
        {
            Ok(TransitionOutcome::Applied {
                from: current,
                to: target,
            })
        } else {
            Err(StateMachineError::ConcurrentModification {
                expected: current.to_string(),
                actual: "changed".to_string(),
            }
            .into())
        }
    }
}
