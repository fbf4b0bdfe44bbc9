//! Shared harness for orchestration integration tests.
//!
//! Everything runs in-process: in-memory store and queue, and a backend that records
//! dispatches instead of making HTTP calls. Tests drive the workers one message at a
//! time through `dispatch_next` and `signal`.

#![allow(dead_code)]

pub mod strategies;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use script_orchestrator::backend::{AutomationBackend, BackendError, DispatchCommand};
use script_orchestrator::config::{OrchestratorConfig, QueueConfig};
use script_orchestrator::database::{ExecutionStore, InMemoryExecutionStore};
use script_orchestrator::messaging::{
    send_json, CompletionSignal, InMemoryMessageQueue, MessageQueue, MessagingError,
    MessagingResult, QueuedMessage,
};
use script_orchestrator::models::{
    EdgeDefinition, Machine, Profile, ScriptDefinition, StepDefinition, StepExecution,
};
use script_orchestrator::orchestration::{
    CompletionListener, DispatchWorker, MessageDisposition, OrchestrationCore,
};

/// A dispatch captured by [`RecordingBackend`]
#[derive(Debug, Clone)]
pub struct RecordedDispatch {
    pub tunnel: String,
    pub command: DispatchCommand,
}

#[derive(Debug, Default)]
pub struct RecordingBackend {
    dispatched: Mutex<Vec<RecordedDispatch>>,
    fail_next: Mutex<Option<BackendError>>,
}

impl RecordingBackend {
    pub fn dispatched(&self) -> Vec<RecordedDispatch> {
        self.dispatched.lock().clone()
    }

    pub fn dispatched_step_ids(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .iter()
            .map(|d| d.command.step_id.clone())
            .collect()
    }

    /// Make the next dispatch fail before it is issued
    pub fn fail_next_with(&self, error: BackendError) {
        *self.fail_next.lock() = Some(error);
    }
}

#[async_trait]
impl AutomationBackend for RecordingBackend {
    async fn dispatch(&self, tunnel: &str, command: DispatchCommand) -> Result<(), BackendError> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        self.dispatched.lock().push(RecordedDispatch {
            tunnel: tunnel.to_string(),
            command,
        });
        Ok(())
    }
}

/// Queue wrapper that fails a configured number of sends per queue, standing in for
/// a broker that drops connections
#[derive(Debug)]
pub struct FaultyQueue {
    inner: Arc<InMemoryMessageQueue>,
    failing_sends: Mutex<HashMap<String, usize>>,
    failing_delayed_sends: Mutex<HashMap<String, usize>>,
}

impl FaultyQueue {
    pub fn new(inner: Arc<InMemoryMessageQueue>) -> Self {
        Self {
            inner,
            failing_sends: Mutex::new(HashMap::new()),
            failing_delayed_sends: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` immediate sends to `queue_name`
    pub fn fail_sends(&self, queue_name: &str, times: usize) {
        self.failing_sends
            .lock()
            .insert(queue_name.to_string(), times);
    }

    /// Fail the next `times` delayed sends (backoff republishes) to `queue_name`
    pub fn fail_delayed_sends(&self, queue_name: &str, times: usize) {
        self.failing_delayed_sends
            .lock()
            .insert(queue_name.to_string(), times);
    }

    fn take_fault(faults: &Mutex<HashMap<String, usize>>, queue_name: &str) -> bool {
        let mut faults = faults.lock();
        match faults.get_mut(queue_name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl MessageQueue for FaultyQueue {
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()> {
        self.inner.ensure_queue(queue_name).await
    }

    async fn send(&self, queue_name: &str, payload: &serde_json::Value) -> MessagingResult<i64> {
        if Self::take_fault(&self.failing_sends, queue_name) {
            return Err(MessagingError::queue_operation(
                queue_name,
                "send",
                "connection reset by peer",
            ));
        }
        self.inner.send(queue_name, payload).await
    }

    async fn send_delayed(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay: Duration,
    ) -> MessagingResult<i64> {
        if Self::take_fault(&self.failing_delayed_sends, queue_name) {
            return Err(MessagingError::queue_operation(
                queue_name,
                "send_delayed",
                "connection reset by peer",
            ));
        }
        self.inner.send_delayed(queue_name, payload, delay).await
    }

    async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> MessagingResult<Option<QueuedMessage>> {
        self.inner.receive(queue_name, visibility_timeout).await
    }

    async fn ack(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        self.inner.ack(queue_name, msg_id).await
    }

    async fn archive(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        self.inner.archive(queue_name, msg_id).await
    }

    async fn queue_length(&self, queue_name: &str) -> MessagingResult<u64> {
        self.inner.queue_length(queue_name).await
    }
}

pub struct TestOrchestrator {
    pub store: Arc<InMemoryExecutionStore>,
    /// The healthy queue underneath `faults`; use it to inspect and to inject signals
    pub queue: Arc<InMemoryMessageQueue>,
    /// What the orchestrator publishes through
    pub faults: Arc<FaultyQueue>,
    pub backend: Arc<RecordingBackend>,
    pub core: OrchestrationCore,
    pub worker: DispatchWorker,
    pub listener: CompletionListener,
}

impl TestOrchestrator {
    pub async fn new() -> Self {
        Self::with_config(OrchestratorConfig::default()).await
    }

    pub async fn with_config(config: OrchestratorConfig) -> Self {
        let store = Arc::new(InMemoryExecutionStore::new());
        let queue = Arc::new(InMemoryMessageQueue::new());
        let faults = Arc::new(FaultyQueue::new(queue.clone()));
        let backend = Arc::new(RecordingBackend::default());

        let recording = backend.clone();
        let core = OrchestrationCore::assemble(&config, store.clone(), faults.clone(), move |_| {
            Ok(recording as Arc<dyn AutomationBackend>)
        })
        .expect("assemble orchestration core");
        core.ensure_queues().await.expect("create queues");

        let worker = core.dispatch_worker(0);
        let listener = core.completion_listener();

        Self {
            store,
            queue,
            faults,
            backend,
            core,
            worker,
            listener,
        }
    }

    pub fn queues(&self) -> &QueueConfig {
        &self.core.config().queues
    }

    pub fn add_machine(&self, name: &str, running_jobs: i64, profile_ids: Vec<Uuid>) -> Machine {
        let machine = Machine {
            machine_id: Uuid::new_v4(),
            name: name.to_string(),
            online: true,
            tunnel_url: Some(format!("https://{name}.tunnel.test")),
            running_job_count: Some(running_jobs),
            cpu_percent: Some(10.0),
            free_memory_gb: Some(4.0),
            profile_ids,
            metrics_updated_at: None,
        };
        self.store.upsert_machine(machine.clone());
        machine
    }

    pub fn add_profile(&self, account_ref: Option<&str>) -> Uuid {
        let profile_id = Uuid::new_v4();
        let mut profile = Profile::new(profile_id, "shared-profile");
        profile.account_ref = account_ref.map(str::to_string);
        self.store.upsert_profile(profile);
        profile_id
    }

    /// Save a script whose steps are created in `step_ids` order
    pub async fn save_script(
        &self,
        user_id: Uuid,
        profile_id: Option<Uuid>,
        step_ids: &[&str],
        edges: &[(&str, &str)],
    ) -> Uuid {
        let script_id = Uuid::new_v4();
        let definition = ScriptDefinition {
            script_id,
            user_id,
            name: "test script".to_string(),
            topic: Some("testing".to_string()),
            profile_id,
            steps: step_ids
                .iter()
                .map(|id| StepDefinition {
                    step_id: id.to_string(),
                    name: format!("Step {id}"),
                    output_name: Some(format!("{id}.out")),
                    instructions: format!("Run {id}"),
                })
                .collect(),
            edges: edges
                .iter()
                .enumerate()
                .map(|(i, (source, target))| EdgeDefinition {
                    edge_id: format!("e{i}"),
                    source_step_id: source.to_string(),
                    target_step_id: target.to_string(),
                })
                .collect(),
        };
        self.store
            .save_script(&definition)
            .await
            .expect("save script");
        script_id
    }

    /// Let the dispatch worker handle one message
    pub async fn dispatch_next(&self) -> Option<MessageDisposition> {
        self.worker.process_next().await.expect("dispatch worker")
    }

    /// Publish a completion signal and let the listener handle it
    pub async fn signal(&self, signal: CompletionSignal) -> Option<MessageDisposition> {
        send_json(self.queue.as_ref(), &self.queues().completions, &signal)
            .await
            .expect("send completion signal");
        self.listener.process_next().await.expect("completion listener")
    }

    /// Move the queue clock past the visibility timeout so released messages return
    pub async fn expire_visibility(&self) {
        let timeout = self.queues().visibility_timeout_seconds.max(0) as u64;
        self.queue
            .advance_time(Duration::from_secs(timeout))
            .await;
    }

    pub async fn step_executions(&self, execution_id: Uuid) -> Vec<StepExecution> {
        self.store
            .list_step_executions(execution_id)
            .await
            .expect("list step executions")
    }
}
