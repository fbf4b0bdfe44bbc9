//! # In-Memory Execution Store
//!
//! Single-process [`ExecutionStore`] for tests and local development. One
//! `parking_lot::Mutex` guards the whole state, so every operation (including the
//! concurrency-cap check and the lock compare-and-set) is trivially atomic.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use super::{ExecutionStore, LockAttempt, LockRelease, StoreError, StoreResult};
use crate::models::{
    Execution, LockState, Machine, NewExecution, NewUploadAssociation, Profile, Script,
    ScriptDefinition, ScriptGraph, ScriptStep, StepEdge, StepExecution, TunnelAssignment,
    UploadAssociation,
};
use crate::state_machine::{ExecutionState, StepExecutionState};

type UploadKey = (Uuid, String, i32);

#[derive(Debug, Default)]
struct MemoryState {
    scripts: HashMap<Uuid, Script>,
    /// Per script, ordered by position
    steps: HashMap<Uuid, Vec<ScriptStep>>,
    edges: HashMap<Uuid, Vec<StepEdge>>,
    executions: HashMap<Uuid, Execution>,
    step_executions: HashMap<Uuid, StepExecution>,
    profiles: HashMap<Uuid, Profile>,
    /// Registration order is preserved so candidate order is deterministic
    machines: Vec<Machine>,
    uploads: HashMap<UploadKey, UploadAssociation>,
}

impl MemoryState {
    fn active_executions(&self, user_id: Uuid) -> usize {
        self.executions
            .values()
            .filter(|e| e.user_id == user_id && e.status.is_active())
            .count()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    state: Mutex<MemoryState>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a profile
    pub fn upsert_profile(&self, profile: Profile) {
        self.state.lock().profiles.insert(profile.profile_id, profile);
    }

    /// Register or replace a machine, keeping its original position
    pub fn upsert_machine(&self, machine: Machine) {
        let mut state = self.state.lock();
        match state
            .machines
            .iter_mut()
            .find(|m| m.machine_id == machine.machine_id)
        {
            Some(existing) => *existing = machine,
            None => state.machines.push(machine),
        }
    }

    /// Every execution ever created, newest last
    pub fn executions(&self) -> Vec<Execution> {
        let mut executions: Vec<Execution> =
            self.state.lock().executions.values().cloned().collect();
        executions.sort_by_key(|e| e.created_at);
        executions
    }

    pub fn step_execution_count(&self) -> usize {
        self.state.lock().step_executions.len()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save_script(&self, definition: &ScriptDefinition) -> StoreResult<ScriptGraph> {
        definition
            .validate_references()
            .map_err(StoreError::validation)?;

        let now = Utc::now();
        let mut state = self.state.lock();

        let created_at = state
            .scripts
            .get(&definition.script_id)
            .map(|s| s.created_at)
            .unwrap_or(now);
        let script = Script {
            script_id: definition.script_id,
            user_id: definition.user_id,
            name: definition.name.clone(),
            topic: definition.topic.clone(),
            profile_id: definition.profile_id,
            created_at,
            updated_at: now,
        };

        let existing = state
            .steps
            .remove(&definition.script_id)
            .unwrap_or_default();
        let mut next_position = existing.iter().map(|s| s.position + 1).max().unwrap_or(0);

        let mut steps: Vec<ScriptStep> = definition
            .steps
            .iter()
            .map(|def| match existing.iter().find(|s| s.step_id == def.step_id) {
                Some(prior) => ScriptStep {
                    name: def.name.clone(),
                    output_name: def.output_name.clone(),
                    instructions: def.instructions.clone(),
                    ..prior.clone()
                },
                None => {
                    let position = next_position;
                    next_position += 1;
                    ScriptStep {
                        script_id: definition.script_id,
                        step_id: def.step_id.clone(),
                        name: def.name.clone(),
                        output_name: def.output_name.clone(),
                        instructions: def.instructions.clone(),
                        account_ref: None,
                        position,
                        created_at: now,
                    }
                }
            })
            .collect();
        steps.sort_by_key(|s| s.position);

        let edges: Vec<StepEdge> = definition
            .edges
            .iter()
            .map(|def| StepEdge {
                script_id: definition.script_id,
                edge_id: def.edge_id.clone(),
                source_step_id: def.source_step_id.clone(),
                target_step_id: def.target_step_id.clone(),
            })
            .collect();

        state.scripts.insert(script.script_id, script.clone());
        state.steps.insert(script.script_id, steps.clone());
        state.edges.insert(script.script_id, edges.clone());

        Ok(ScriptGraph {
            script,
            steps,
            edges,
        })
    }

    async fn load_script_graph(&self, script_id: Uuid) -> StoreResult<Option<ScriptGraph>> {
        let state = self.state.lock();
        Ok(state.scripts.get(&script_id).map(|script| ScriptGraph {
            script: script.clone(),
            steps: state.steps.get(&script_id).cloned().unwrap_or_default(),
            edges: state.edges.get(&script_id).cloned().unwrap_or_default(),
        }))
    }

    async fn bind_step_account(
        &self,
        script_id: Uuid,
        step_id: &str,
        account_ref: &str,
    ) -> StoreResult<String> {
        let mut state = self.state.lock();
        let step = state
            .steps
            .get_mut(&script_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.step_id == step_id))
            .ok_or_else(|| StoreError::not_found("Step", format!("{script_id}/{step_id}")))?;

        Ok(step
            .account_ref
            .get_or_insert_with(|| account_ref.to_string())
            .clone())
    }

    async fn create_execution(
        &self,
        new_execution: &NewExecution,
        max_active: usize,
    ) -> StoreResult<(Execution, Vec<StepExecution>)> {
        let mut state = self.state.lock();

        let active = state.active_executions(new_execution.user_id);
        if active >= max_active {
            return Err(StoreError::ConcurrencyLimit {
                user_id: new_execution.user_id,
                active,
                limit: max_active,
            });
        }

        let execution = Execution {
            execution_id: Uuid::new_v4(),
            script_id: new_execution.script_id,
            user_id: new_execution.user_id,
            status: ExecutionState::Pending,
            current_step_id: None,
            tunnel: None,
            machine_id: None,
            profile_id: new_execution.profile_id,
            error_message: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let steps: Vec<StepExecution> = new_execution
            .sorted_step_ids
            .iter()
            .enumerate()
            .map(|(order, step_id)| StepExecution {
                step_execution_id: Uuid::new_v4(),
                execution_id: execution.execution_id,
                step_id: step_id.clone(),
                step_order: order as i32,
                status: StepExecutionState::Pending,
                error_message: None,
                attempts: 0,
                started_at: None,
                completed_at: None,
            })
            .collect();

        state
            .executions
            .insert(execution.execution_id, execution.clone());
        for step in &steps {
            state
                .step_executions
                .insert(step.step_execution_id, step.clone());
        }

        Ok((execution, steps))
    }

    async fn get_execution(&self, execution_id: Uuid) -> StoreResult<Option<Execution>> {
        Ok(self.state.lock().executions.get(&execution_id).cloned())
    }

    async fn count_active_executions(&self, user_id: Uuid) -> StoreResult<usize> {
        Ok(self.state.lock().active_executions(user_id))
    }

    async fn transition_execution(
        &self,
        execution_id: Uuid,
        from: ExecutionState,
        to: ExecutionState,
        error_message: Option<&str>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let execution = state
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::not_found("Execution", execution_id))?;

        if execution.status != from {
            return Ok(false);
        }

        let now = Utc::now();
        execution.status = to;
        if to == ExecutionState::Running && execution.started_at.is_none() {
            execution.started_at = Some(now);
        }
        if to.is_terminal() {
            execution.completed_at = Some(now);
        }
        if let Some(message) = error_message {
            execution.error_message = Some(message.to_string());
        }
        Ok(true)
    }

    async fn set_current_step(&self, execution_id: Uuid, step_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let execution = state
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::not_found("Execution", execution_id))?;
        execution.current_step_id = Some(step_id.to_string());
        Ok(())
    }

    async fn set_tunnel(
        &self,
        execution_id: Uuid,
        assignment: Option<&TunnelAssignment>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        let execution = state
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::not_found("Execution", execution_id))?;
        execution.tunnel = assignment.map(|a| a.tunnel.clone());
        execution.machine_id = assignment.map(|a| a.machine_id);
        Ok(())
    }

    async fn increment_execution_retry(&self, execution_id: Uuid) -> StoreResult<i32> {
        let mut state = self.state.lock();
        let execution = state
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::not_found("Execution", execution_id))?;
        execution.retry_count += 1;
        Ok(execution.retry_count)
    }

    async fn get_step_execution(
        &self,
        step_execution_id: Uuid,
    ) -> StoreResult<Option<StepExecution>> {
        Ok(self
            .state
            .lock()
            .step_executions
            .get(&step_execution_id)
            .cloned())
    }

    async fn find_step_execution(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> StoreResult<Option<StepExecution>> {
        Ok(self
            .state
            .lock()
            .step_executions
            .values()
            .find(|s| s.execution_id == execution_id && s.step_id == step_id)
            .cloned())
    }

    async fn list_step_executions(&self, execution_id: Uuid) -> StoreResult<Vec<StepExecution>> {
        let mut steps: Vec<StepExecution> = self
            .state
            .lock()
            .step_executions
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_order);
        Ok(steps)
    }

    async fn transition_step(
        &self,
        step_execution_id: Uuid,
        from: StepExecutionState,
        to: StepExecutionState,
        error_message: Option<&str>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let step = state
            .step_executions
            .get_mut(&step_execution_id)
            .ok_or_else(|| StoreError::not_found("StepExecution", step_execution_id))?;

        if step.status != from {
            return Ok(false);
        }

        let now = Utc::now();
        step.status = to;
        match to {
            StepExecutionState::Running => {
                step.attempts += 1;
                step.started_at = Some(now);
                step.completed_at = None;
            }
            StepExecutionState::Pending => step.completed_at = None,
            StepExecutionState::Completed | StepExecutionState::Failed => {
                step.completed_at = Some(now)
            }
        }
        if let Some(message) = error_message {
            step.error_message = Some(message.to_string());
        }
        Ok(true)
    }

    async fn get_profile(&self, profile_id: Uuid) -> StoreResult<Option<Profile>> {
        Ok(self.state.lock().profiles.get(&profile_id).cloned())
    }

    async fn try_acquire_profile_lock(
        &self,
        profile_id: Uuid,
        machine_id: Uuid,
        execution_id: Uuid,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> StoreResult<LockAttempt> {
        let mut state = self.state.lock();
        let profile = state
            .profiles
            .get_mut(&profile_id)
            .ok_or_else(|| StoreError::not_found("Profile", profile_id))?;

        let reclaimed_from = match profile.lock_state() {
            LockState::Free => None,
            LockState::Held { machine_id: holder, since } => {
                if !profile.is_lock_stale(now, expiry) {
                    return Ok(LockAttempt::Held { holder, since });
                }
                Some(holder)
            }
        };

        profile.locked_by_machine_id = Some(machine_id);
        profile.locked_by_execution_id = Some(execution_id);
        profile.lock_acquired_at = Some(now);
        profile.lock_released_at = None;

        Ok(LockAttempt::Acquired {
            acquired_at: now,
            reclaimed_from,
        })
    }

    async fn release_profile_lock(
        &self,
        profile_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<LockRelease> {
        let mut state = self.state.lock();
        let profile = state
            .profiles
            .get_mut(&profile_id)
            .ok_or_else(|| StoreError::not_found("Profile", profile_id))?;

        let released = LockRelease {
            previous_machine: profile.locked_by_machine_id.take(),
            previous_execution: profile.locked_by_execution_id.take(),
        };
        profile.lock_released_at = Some(now);
        Ok(released)
    }

    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        Ok(self.state.lock().machines.clone())
    }

    async fn upsert_upload(
        &self,
        upload: &NewUploadAssociation,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<UploadAssociation> {
        let association = UploadAssociation {
            user_id: upload.user_id,
            step_id: upload.step_id.clone(),
            slot: upload.slot,
            file_id: upload.file_id.clone(),
            uploaded_at: now,
            expires_at: now + ttl,
        };
        self.state.lock().uploads.insert(
            (upload.user_id, upload.step_id.clone(), upload.slot),
            association.clone(),
        );
        Ok(association)
    }

    async fn list_uploads(
        &self,
        user_id: Uuid,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<UploadAssociation>> {
        let mut uploads: Vec<UploadAssociation> = self
            .state
            .lock()
            .uploads
            .values()
            .filter(|u| u.user_id == user_id && u.step_id == step_id && !u.is_expired(now))
            .cloned()
            .collect();
        uploads.sort_by_key(|u| u.slot);
        Ok(uploads)
    }
}
