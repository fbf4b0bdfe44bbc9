//! # PostgreSQL Execution Store
//!
//! sqlx-backed [`ExecutionStore`]. Queries are checked at runtime (no database is
//! needed to build). Schema lives in `migrations/` and is applied through [`MIGRATOR`].
//!
//! - The per-user concurrency cap is enforced inside one transaction that first takes
//!   a transaction-scoped advisory lock keyed by the user id, so two submits for the
//!   same user serialize while different users proceed in parallel.
//! - Profile lock acquisition is a single conditional `UPDATE ... RETURNING`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ExecutionStore, LockAttempt, LockRelease, StoreError, StoreResult};
use crate::config::DatabaseConfig;
use crate::models::{
    Execution, Machine, NewExecution, NewUploadAssociation, Profile, Script, ScriptDefinition,
    ScriptGraph, ScriptStep, StepEdge, StepExecution, TunnelAssignment, UploadAssociation,
};
use crate::state_machine::{ExecutionState, StepExecutionState};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, FromRow)]
struct ScriptRow {
    script_id: Uuid,
    user_id: Uuid,
    name: String,
    topic: Option<String>,
    profile_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ScriptRow> for Script {
    fn from(row: ScriptRow) -> Self {
        Self {
            script_id: row.script_id,
            user_id: row.user_id,
            name: row.name,
            topic: row.topic,
            profile_id: row.profile_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct StepRow {
    script_id: Uuid,
    step_id: String,
    name: String,
    output_name: Option<String>,
    instructions: String,
    account_ref: Option<String>,
    position: i32,
    created_at: DateTime<Utc>,
}

impl From<StepRow> for ScriptStep {
    fn from(row: StepRow) -> Self {
        Self {
            script_id: row.script_id,
            step_id: row.step_id,
            name: row.name,
            output_name: row.output_name,
            instructions: row.instructions,
            account_ref: row.account_ref,
            position: row.position,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct EdgeRow {
    script_id: Uuid,
    edge_id: String,
    source_step_id: String,
    target_step_id: String,
}

impl From<EdgeRow> for StepEdge {
    fn from(row: EdgeRow) -> Self {
        Self {
            script_id: row.script_id,
            edge_id: row.edge_id,
            source_step_id: row.source_step_id,
            target_step_id: row.target_step_id,
        }
    }
}

#[derive(Debug, FromRow)]
struct ExecutionRow {
    execution_id: Uuid,
    script_id: Uuid,
    user_id: Uuid,
    status: String,
    current_step_id: Option<String>,
    tunnel: Option<String>,
    machine_id: Option<Uuid>,
    profile_id: Option<Uuid>,
    error_message: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<ExecutionState>()
            .map_err(StoreError::invalid_data)?;
        Ok(Self {
            execution_id: row.execution_id,
            script_id: row.script_id,
            user_id: row.user_id,
            status,
            current_step_id: row.current_step_id,
            tunnel: row.tunnel,
            machine_id: row.machine_id,
            profile_id: row.profile_id,
            error_message: row.error_message,
            retry_count: row.retry_count,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct StepExecutionRow {
    step_execution_id: Uuid,
    execution_id: Uuid,
    step_id: String,
    step_order: i32,
    status: String,
    error_message: Option<String>,
    attempts: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepExecutionRow> for StepExecution {
    type Error = StoreError;

    fn try_from(row: StepExecutionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<StepExecutionState>()
            .map_err(StoreError::invalid_data)?;
        Ok(Self {
            step_execution_id: row.step_execution_id,
            execution_id: row.execution_id,
            step_id: row.step_id,
            step_order: row.step_order,
            status,
            error_message: row.error_message,
            attempts: row.attempts,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ProfileRow {
    profile_id: Uuid,
    name: String,
    account_ref: Option<String>,
    locked_by_machine_id: Option<Uuid>,
    locked_by_execution_id: Option<Uuid>,
    lock_acquired_at: Option<DateTime<Utc>>,
    lock_released_at: Option<DateTime<Utc>>,
}

impl From<ProfileRow> for Profile {
    fn from(row: ProfileRow) -> Self {
        Self {
            profile_id: row.profile_id,
            name: row.name,
            account_ref: row.account_ref,
            locked_by_machine_id: row.locked_by_machine_id,
            locked_by_execution_id: row.locked_by_execution_id,
            lock_acquired_at: row.lock_acquired_at,
            lock_released_at: row.lock_released_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MachineRow {
    machine_id: Uuid,
    name: String,
    online: bool,
    tunnel_url: Option<String>,
    running_job_count: Option<i64>,
    cpu_percent: Option<f64>,
    free_memory_gb: Option<f64>,
    metrics_updated_at: Option<DateTime<Utc>>,
    profile_ids: Vec<Uuid>,
}

impl From<MachineRow> for Machine {
    fn from(row: MachineRow) -> Self {
        Self {
            machine_id: row.machine_id,
            name: row.name,
            online: row.online,
            tunnel_url: row.tunnel_url,
            running_job_count: row.running_job_count,
            cpu_percent: row.cpu_percent,
            free_memory_gb: row.free_memory_gb,
            profile_ids: row.profile_ids,
            metrics_updated_at: row.metrics_updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct UploadRow {
    user_id: Uuid,
    step_id: String,
    slot: i32,
    file_id: String,
    uploaded_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<UploadRow> for UploadAssociation {
    fn from(row: UploadRow) -> Self {
        Self {
            user_id: row.user_id,
            step_id: row.step_id,
            slot: row.slot,
            file_id: row.file_id,
            uploaded_at: row.uploaded_at,
            expires_at: row.expires_at,
        }
    }
}

const EXECUTION_COLUMNS: &str = "execution_id, script_id, user_id, status, current_step_id, \
     tunnel, machine_id, profile_id, error_message, retry_count, created_at, started_at, \
     completed_at";

const STEP_EXECUTION_COLUMNS: &str = "step_execution_id, execution_id, step_id, step_order, \
     status, error_message, attempts, started_at, completed_at";

#[derive(Debug, Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the database section of the configuration, applying migrations
    /// when enabled.
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.resolved_url())
            .await?;

        let store = Self::new(pool);
        if config.run_migrations {
            store.migrate().await?;
        }
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("✅ DATABASE: Migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_user(tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> StoreResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    async fn save_script(&self, definition: &ScriptDefinition) -> StoreResult<ScriptGraph> {
        definition
            .validate_references()
            .map_err(StoreError::validation)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO scripts (script_id, user_id, name, topic, profile_id)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (script_id) DO UPDATE
               SET name = EXCLUDED.name,
                   topic = EXCLUDED.topic,
                   profile_id = EXCLUDED.profile_id,
                   updated_at = now()",
        )
        .bind(definition.script_id)
        .bind(definition.user_id)
        .bind(&definition.name)
        .bind(&definition.topic)
        .bind(definition.profile_id)
        .execute(&mut *tx)
        .await?;

        let step_ids: Vec<String> = definition.steps.iter().map(|s| s.step_id.clone()).collect();
        let edge_ids: Vec<String> = definition.edges.iter().map(|e| e.edge_id.clone()).collect();

        sqlx::query("DELETE FROM script_edges WHERE script_id = $1 AND NOT (edge_id = ANY($2))")
            .bind(definition.script_id)
            .bind(&edge_ids)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM script_steps WHERE script_id = $1 AND NOT (step_id = ANY($2))")
            .bind(definition.script_id)
            .bind(&step_ids)
            .execute(&mut *tx)
            .await?;

        let positions: HashMap<String, i32> =
            sqlx::query_as::<_, (String, i32)>(
                "SELECT step_id, position FROM script_steps WHERE script_id = $1",
            )
            .bind(definition.script_id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();
        let mut next_position = positions.values().map(|p| p + 1).max().unwrap_or(0);

        for step in &definition.steps {
            let position = match positions.get(&step.step_id) {
                Some(existing) => *existing,
                None => {
                    next_position += 1;
                    next_position - 1
                }
            };

            // Position and account binding survive re-saves
            sqlx::query(
                "INSERT INTO script_steps
                   (script_id, step_id, name, output_name, instructions, position)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (script_id, step_id) DO UPDATE
                   SET name = EXCLUDED.name,
                       output_name = EXCLUDED.output_name,
                       instructions = EXCLUDED.instructions",
            )
            .bind(definition.script_id)
            .bind(&step.step_id)
            .bind(&step.name)
            .bind(&step.output_name)
            .bind(&step.instructions)
            .bind(position)
            .execute(&mut *tx)
            .await?;
        }

        for edge in &definition.edges {
            sqlx::query(
                "INSERT INTO script_edges (script_id, edge_id, source_step_id, target_step_id)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (script_id, edge_id) DO UPDATE
                   SET source_step_id = EXCLUDED.source_step_id,
                       target_step_id = EXCLUDED.target_step_id",
            )
            .bind(definition.script_id)
            .bind(&edge.edge_id)
            .bind(&edge.source_step_id)
            .bind(&edge.target_step_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            script_id = %definition.script_id,
            steps = definition.steps.len(),
            edges = definition.edges.len(),
            "💾 DATABASE: Script saved"
        );

        self.load_script_graph(definition.script_id)
            .await?
            .ok_or_else(|| StoreError::not_found("Script", definition.script_id))
    }

    async fn load_script_graph(&self, script_id: Uuid) -> StoreResult<Option<ScriptGraph>> {
        let script = sqlx::query_as::<_, ScriptRow>(
            "SELECT script_id, user_id, name, topic, profile_id, created_at, updated_at
             FROM scripts WHERE script_id = $1",
        )
        .bind(script_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(script) = script else {
            return Ok(None);
        };

        let steps = sqlx::query_as::<_, StepRow>(
            "SELECT script_id, step_id, name, output_name, instructions, account_ref, position,
                    created_at
             FROM script_steps WHERE script_id = $1
             ORDER BY position, created_at",
        )
        .bind(script_id)
        .fetch_all(&self.pool)
        .await?;

        let edges = sqlx::query_as::<_, EdgeRow>(
            "SELECT script_id, edge_id, source_step_id, target_step_id
             FROM script_edges WHERE script_id = $1
             ORDER BY edge_id",
        )
        .bind(script_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(ScriptGraph {
            script: script.into(),
            steps: steps.into_iter().map(ScriptStep::from).collect(),
            edges: edges.into_iter().map(StepEdge::from).collect(),
        }))
    }

    async fn bind_step_account(
        &self,
        script_id: Uuid,
        step_id: &str,
        account_ref: &str,
    ) -> StoreResult<String> {
        let bound: Option<Option<String>> = sqlx::query_scalar(
            "UPDATE script_steps SET account_ref = COALESCE(account_ref, $3)
             WHERE script_id = $1 AND step_id = $2
             RETURNING account_ref",
        )
        .bind(script_id)
        .bind(step_id)
        .bind(account_ref)
        .fetch_optional(&self.pool)
        .await?;

        bound
            .flatten()
            .ok_or_else(|| StoreError::not_found("Step", format!("{script_id}/{step_id}")))
    }

    async fn create_execution(
        &self,
        new_execution: &NewExecution,
        max_active: usize,
    ) -> StoreResult<(Execution, Vec<StepExecution>)> {
        let mut tx = self.pool.begin().await?;
        Self::lock_user(&mut tx, new_execution.user_id).await?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM executions
             WHERE user_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(new_execution.user_id)
        .fetch_one(&mut *tx)
        .await?;
        let active = usize::try_from(active).unwrap_or(usize::MAX);

        if active >= max_active {
            tx.rollback().await?;
            return Err(StoreError::ConcurrencyLimit {
                user_id: new_execution.user_id,
                active,
                limit: max_active,
            });
        }

        let execution: Execution = sqlx::query_as::<_, ExecutionRow>(&format!(
            "INSERT INTO executions (execution_id, script_id, user_id, status, profile_id)
             VALUES ($1, $2, $3, 'pending', $4)
             RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(new_execution.script_id)
        .bind(new_execution.user_id)
        .bind(new_execution.profile_id)
        .fetch_one(&mut *tx)
        .await?
        .try_into()?;

        let mut steps = Vec::with_capacity(new_execution.sorted_step_ids.len());
        for (order, step_id) in new_execution.sorted_step_ids.iter().enumerate() {
            let step: StepExecution = sqlx::query_as::<_, StepExecutionRow>(&format!(
                "INSERT INTO step_executions
                   (step_execution_id, execution_id, step_id, step_order, status)
                 VALUES ($1, $2, $3, $4, 'pending')
                 RETURNING {STEP_EXECUTION_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(execution.execution_id)
            .bind(step_id)
            .bind(order as i32)
            .fetch_one(&mut *tx)
            .await?
            .try_into()?;
            steps.push(step);
        }

        tx.commit().await?;
        Ok((execution, steps))
    }

    async fn get_execution(&self, execution_id: Uuid) -> StoreResult<Option<Execution>> {
        sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = $1"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Execution::try_from)
        .transpose()
    }

    async fn count_active_executions(&self, user_id: Uuid) -> StoreResult<usize> {
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM executions
             WHERE user_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(active).unwrap_or(0))
    }

    async fn transition_execution(
        &self,
        execution_id: Uuid,
        from: ExecutionState,
        to: ExecutionState,
        error_message: Option<&str>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE executions
             SET status = $3,
                 started_at = CASE WHEN $3 = 'running' THEN COALESCE(started_at, now())
                                   ELSE started_at END,
                 completed_at = CASE WHEN $3 IN ('completed', 'failed') THEN now()
                                     ELSE completed_at END,
                 error_message = COALESCE($4, error_message)
             WHERE execution_id = $1 AND status = $2",
        )
        .bind(execution_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_current_step(&self, execution_id: Uuid, step_id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE executions SET current_step_id = $2 WHERE execution_id = $1")
            .bind(execution_id)
            .bind(step_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_tunnel(
        &self,
        execution_id: Uuid,
        assignment: Option<&TunnelAssignment>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE executions SET tunnel = $2, machine_id = $3 WHERE execution_id = $1")
            .bind(execution_id)
            .bind(assignment.map(|a| a.tunnel.as_str()))
            .bind(assignment.map(|a| a.machine_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_execution_retry(&self, execution_id: Uuid) -> StoreResult<i32> {
        let count: Option<i32> = sqlx::query_scalar(
            "UPDATE executions SET retry_count = retry_count + 1
             WHERE execution_id = $1
             RETURNING retry_count",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;
        count.ok_or_else(|| StoreError::not_found("Execution", execution_id))
    }

    async fn get_step_execution(
        &self,
        step_execution_id: Uuid,
    ) -> StoreResult<Option<StepExecution>> {
        sqlx::query_as::<_, StepExecutionRow>(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} FROM step_executions WHERE step_execution_id = $1"
        ))
        .bind(step_execution_id)
        .fetch_optional(&self.pool)
        .await?
        .map(StepExecution::try_from)
        .transpose()
    }

    async fn find_step_execution(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> StoreResult<Option<StepExecution>> {
        sqlx::query_as::<_, StepExecutionRow>(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} FROM step_executions
             WHERE execution_id = $1 AND step_id = $2"
        ))
        .bind(execution_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?
        .map(StepExecution::try_from)
        .transpose()
    }

    async fn list_step_executions(&self, execution_id: Uuid) -> StoreResult<Vec<StepExecution>> {
        sqlx::query_as::<_, StepExecutionRow>(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} FROM step_executions
             WHERE execution_id = $1 ORDER BY step_order"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(StepExecution::try_from)
        .collect()
    }

    async fn transition_step(
        &self,
        step_execution_id: Uuid,
        from: StepExecutionState,
        to: StepExecutionState,
        error_message: Option<&str>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE step_executions
             SET status = $3,
                 attempts = CASE WHEN $3 = 'running' THEN attempts + 1 ELSE attempts END,
                 started_at = CASE WHEN $3 = 'running' THEN now() ELSE started_at END,
                 completed_at = CASE WHEN $3 IN ('completed', 'failed') THEN now()
                                     ELSE NULL END,
                 error_message = COALESCE($4, error_message)
             WHERE step_execution_id = $1 AND status = $2",
        )
        .bind(step_execution_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_profile(&self, profile_id: Uuid) -> StoreResult<Option<Profile>> {
        Ok(sqlx::query_as::<_, ProfileRow>(
            "SELECT profile_id, name, account_ref, locked_by_machine_id, locked_by_execution_id,
                    lock_acquired_at, lock_released_at
             FROM profiles WHERE profile_id = $1",
        )
        .bind(profile_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Profile::from))
    }

    async fn try_acquire_profile_lock(
        &self,
        profile_id: Uuid,
        machine_id: Uuid,
        execution_id: Uuid,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> StoreResult<LockAttempt> {
        let stale_before = now - expiry;

        // prior sees the row as it was before this statement's update
        let acquired: Option<Option<Uuid>> = sqlx::query_scalar(
            "WITH prior AS (
                 SELECT locked_by_machine_id AS previous_holder
                 FROM profiles WHERE profile_id = $1
                 FOR UPDATE
             )
             UPDATE profiles p
             SET locked_by_machine_id = $2,
                 locked_by_execution_id = $3,
                 lock_acquired_at = $4,
                 lock_released_at = NULL
             FROM prior
             WHERE p.profile_id = $1
               AND (p.locked_by_machine_id IS NULL
                    OR p.lock_acquired_at IS NULL
                    OR p.lock_acquired_at < $5)
             RETURNING prior.previous_holder",
        )
        .bind(profile_id)
        .bind(machine_id)
        .bind(execution_id)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(reclaimed_from) = acquired {
            return Ok(LockAttempt::Acquired {
                acquired_at: now,
                reclaimed_from,
            });
        }

        let profile = self
            .get_profile(profile_id)
            .await?
            .ok_or_else(|| StoreError::not_found("Profile", profile_id))?;

        match (profile.locked_by_machine_id, profile.lock_acquired_at) {
            (Some(holder), Some(since)) => Ok(LockAttempt::Held { holder, since }),
            // Released between the update and this read; report it as contention
            // rather than retrying so acquire stays fail-fast
            _ => Ok(LockAttempt::Held {
                holder: profile.locked_by_machine_id.unwrap_or_default(),
                since: profile.lock_acquired_at.unwrap_or(now),
            }),
        }
    }

    async fn release_profile_lock(
        &self,
        profile_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<LockRelease> {
        let released: Option<(Option<Uuid>, Option<Uuid>)> = sqlx::query_as(
            "WITH prior AS (
                 SELECT locked_by_machine_id, locked_by_execution_id
                 FROM profiles WHERE profile_id = $1
                 FOR UPDATE
             )
             UPDATE profiles p
             SET locked_by_machine_id = NULL,
                 locked_by_execution_id = NULL,
                 lock_released_at = $2
             FROM prior
             WHERE p.profile_id = $1
             RETURNING prior.locked_by_machine_id, prior.locked_by_execution_id",
        )
        .bind(profile_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let (previous_machine, previous_execution) =
            released.ok_or_else(|| StoreError::not_found("Profile", profile_id))?;
        Ok(LockRelease {
            previous_machine,
            previous_execution,
        })
    }

    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        Ok(sqlx::query_as::<_, MachineRow>(
            "SELECT m.machine_id, m.name, m.online, m.tunnel_url, m.running_job_count,
                    m.cpu_percent, m.free_memory_gb, m.metrics_updated_at,
                    COALESCE(
                        array_agg(mp.profile_id) FILTER (WHERE mp.profile_id IS NOT NULL),
                        '{}'
                    ) AS profile_ids
             FROM machines m
             LEFT JOIN machine_profiles mp ON mp.machine_id = m.machine_id
             GROUP BY m.machine_id
             ORDER BY m.created_at, m.machine_id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Machine::from)
        .collect())
    }

    async fn upsert_upload(
        &self,
        upload: &NewUploadAssociation,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<UploadAssociation> {
        Ok(sqlx::query_as::<_, UploadRow>(
            "INSERT INTO upload_associations
               (user_id, step_id, slot, file_id, uploaded_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (user_id, step_id, slot) DO UPDATE
               SET file_id = EXCLUDED.file_id,
                   uploaded_at = EXCLUDED.uploaded_at,
                   expires_at = EXCLUDED.expires_at
             RETURNING user_id, step_id, slot, file_id, uploaded_at, expires_at",
        )
        .bind(upload.user_id)
        .bind(&upload.step_id)
        .bind(upload.slot)
        .bind(&upload.file_id)
        .bind(now)
        .bind(now + ttl)
        .fetch_one(&self.pool)
        .await?
        .into())
    }

    async fn list_uploads(
        &self,
        user_id: Uuid,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<UploadAssociation>> {
        Ok(sqlx::query_as::<_, UploadRow>(
            "SELECT user_id, step_id, slot, file_id, uploaded_at, expires_at
             FROM upload_associations
             WHERE user_id = $1 AND step_id = $2 AND expires_at > $3
             ORDER BY slot",
        )
        .bind(user_id)
        .bind(step_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(UploadAssociation::from)
        .collect())
    }
}
