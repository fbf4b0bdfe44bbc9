//! # Orchestration Bootstrap
//!
//! Wires configuration, store, queue and remote backend into running components.
//!
//! - [`OrchestrationCore::assemble`] builds the components around any store, queue
//!   and backend (tests use the in-memory ones)
//! - [`OrchestratorSystem::bootstrap`] connects to PostgreSQL and pgmq, uses the HTTP
//!   backend, and starts the supervised workers
//! - [`OrchestratorSystem::shutdown`] stops every worker and waits for it to exit

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use super::completion_bridge::CompletionBridge;
use super::completion_listener::CompletionListener;
use super::dispatch_worker::DispatchWorker;
use super::lock_manager::ResourceLockManager;
use super::machine_selector::MachineSelector;
use super::step_dispatcher::StepDispatcher;
use super::submission::{ScriptSubmitter, SubmissionResult};
use super::supervisor::spawn_supervised;
use super::upload_registry::UploadRegistry;
use crate::backend::{AutomationBackend, DispatchFailureSink, HttpAutomationBackend};
use crate::config::{ConfigManager, OrchestratorConfig};
use crate::database::{ExecutionStore, PostgresExecutionStore};
use crate::error::{OrchestratorError, Result};
use crate::messaging::{DispatchPublisher, MessageQueue, PgmqMessageQueue};

/// Every orchestration component, built once and shared by the workers
pub struct OrchestrationCore {
    config: OrchestratorConfig,
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn MessageQueue>,
    publisher: DispatchPublisher,
    submitter: ScriptSubmitter,
    dispatcher: Arc<StepDispatcher>,
    bridge: Arc<CompletionBridge>,
    uploads: Arc<UploadRegistry>,
}

impl std::fmt::Debug for OrchestrationCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationCore")
            .field("environment", &self.config.execution.environment)
            .field("publisher", &self.publisher)
            .finish()
    }
}

impl OrchestrationCore {
    /// Build all components. The backend is created from the completion bridge,
    /// which receives its post-dispatch failures.
    pub fn assemble<F>(
        config: &OrchestratorConfig,
        store: Arc<dyn ExecutionStore>,
        queue: Arc<dyn MessageQueue>,
        backend_factory: F,
    ) -> Result<Self>
    where
        F: FnOnce(Arc<dyn DispatchFailureSink>) -> Result<Arc<dyn AutomationBackend>>,
    {
        let publisher =
            DispatchPublisher::new(queue.clone(), config.queues.clone(), config.retry.clone());
        let lock_manager = ResourceLockManager::new(store.clone(), config.locks.expiry());
        let uploads = Arc::new(UploadRegistry::new(store.clone(), &config.uploads));

        let bridge = Arc::new(CompletionBridge::new(
            store.clone(),
            publisher.clone(),
            lock_manager.clone(),
        ));
        let sink: Arc<dyn DispatchFailureSink> = bridge.clone();
        let backend = backend_factory(sink)?;

        let dispatcher = Arc::new(StepDispatcher::new(
            store.clone(),
            backend,
            MachineSelector::new(config.selector),
            lock_manager,
            uploads.clone(),
        ));
        let submitter = ScriptSubmitter::new(
            store.clone(),
            publisher.clone(),
            config.execution.max_concurrent_executions_per_user,
        );

        Ok(Self {
            config: config.clone(),
            store,
            queue,
            publisher,
            submitter,
            dispatcher,
            bridge,
            uploads,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    pub fn publisher(&self) -> &DispatchPublisher {
        &self.publisher
    }

    pub fn dispatcher(&self) -> &Arc<StepDispatcher> {
        &self.dispatcher
    }

    pub fn bridge(&self) -> &Arc<CompletionBridge> {
        &self.bridge
    }

    pub fn uploads(&self) -> &Arc<UploadRegistry> {
        &self.uploads
    }

    pub async fn ensure_queues(&self) -> Result<()> {
        self.publisher.ensure_queues().await?;
        Ok(())
    }

    pub async fn submit(&self, script_id: Uuid, user_id: Uuid) -> Result<SubmissionResult> {
        self.submitter.submit(script_id, user_id).await
    }

    pub fn dispatch_worker(&self, worker_id: usize) -> DispatchWorker {
        DispatchWorker::new(
            worker_id,
            self.queue.clone(),
            self.config.queues.step_dispatch.clone(),
            self.visibility_timeout(),
            self.config.workers.poll_interval(),
            self.dispatcher.clone(),
            self.bridge.clone(),
        )
    }

    pub fn completion_listener(&self) -> CompletionListener {
        CompletionListener::new(
            self.queue.clone(),
            self.config.queues.completions.clone(),
            self.visibility_timeout(),
            self.config.workers.poll_interval(),
            self.bridge.clone(),
        )
    }

    fn visibility_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.queues.visibility_timeout_seconds.max(0) as u64)
    }
}

/// A running orchestrator: shared components plus supervised worker tasks
pub struct OrchestratorSystem {
    core: Arc<OrchestrationCore>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl OrchestratorSystem {
    /// Connect to PostgreSQL and pgmq from configuration and start all workers
    pub async fn bootstrap(manager: Arc<ConfigManager>) -> Result<Self> {
        let config = manager.config();
        info!(
            environment = %manager.environment(),
            "🚀 BOOTSTRAP: Starting script orchestrator"
        );

        let store = PostgresExecutionStore::connect(&config.database).await?;
        let queue = PgmqMessageQueue::new_with_pool(store.pool().clone()).await;
        let backend_config = config.backend.clone();

        let core = OrchestrationCore::assemble(
            config,
            Arc::new(store),
            Arc::new(queue),
            move |sink| {
                let backend = HttpAutomationBackend::new(&backend_config, sink)
                    .map_err(|e| OrchestratorError::backend(e.to_string()))?;
                Ok(Arc::new(backend) as Arc<dyn AutomationBackend>)
            },
        )?;

        Self::start(Arc::new(core)).await
    }

    /// Create queues and spawn the configured number of dispatch workers plus the
    /// completion listener
    pub async fn start(core: Arc<OrchestrationCore>) -> Result<Self> {
        core.ensure_queues().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = core.config().workers.resubscribe_backoff();
        let worker_count = core.config().workers.dispatch_workers;

        let mut handles = Vec::with_capacity(worker_count + 1);
        for worker_id in 0..worker_count {
            let worker = Arc::new(core.dispatch_worker(worker_id));
            handles.push(spawn_supervised(worker, backoff, shutdown_rx.clone()));
        }
        handles.push(spawn_supervised(
            Arc::new(core.completion_listener()),
            backoff,
            shutdown_rx,
        ));

        info!(
            dispatch_workers = worker_count,
            "✅ BOOTSTRAP: Orchestrator running"
        );

        Ok(Self {
            core,
            shutdown_tx,
            handles,
        })
    }

    pub fn core(&self) -> &Arc<OrchestrationCore> {
        &self.core
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow() && self.handles.iter().any(|h| !h.is_finished())
    }

    /// Signal every worker to stop and wait for them to exit
    pub async fn shutdown(self) {
        info!("🛑 BOOTSTRAP: Shutdown requested");
        self.shutdown_tx.send_replace(true);

        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "❌ BOOTSTRAP: Worker task panicked");
            }
        }
        info!("✅ BOOTSTRAP: All workers stopped");
    }
}
