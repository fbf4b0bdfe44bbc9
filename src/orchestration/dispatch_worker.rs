//! # Dispatch Worker
//!
//! Polls the dispatch queue one message at a time (prefetch 1) and feeds each
//! envelope to the [`StepDispatcher`]. A message is acked only after the resulting
//! state change is durable:
//!
//! - dispatched or dropped: ack
//! - permanent error: fail the execution, then ack
//! - transient error: republish with backoff (or dead-letter), then ack
//! - malformed payload: archive
//!
//! If handling the error itself fails, the message is left unacked and comes back
//! after the visibility timeout.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::completion_bridge::CompletionBridge;
use super::step_dispatcher::{ConsumeOutcome, StepDispatcher};
use super::supervisor::{is_shutdown, sleep_or_shutdown, QueueConsumer};
use crate::messaging::{DispatchEnvelope, MessageQueue, MessagingResult, QueuedMessage};

/// What happened to one received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Acked,
    Archived,
    /// Left for redelivery
    Released,
}

pub struct DispatchWorker {
    worker_id: usize,
    queue: Arc<dyn MessageQueue>,
    queue_name: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
    dispatcher: Arc<StepDispatcher>,
    bridge: Arc<CompletionBridge>,
}

impl DispatchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: usize,
        queue: Arc<dyn MessageQueue>,
        queue_name: impl Into<String>,
        visibility_timeout: Duration,
        poll_interval: Duration,
        dispatcher: Arc<StepDispatcher>,
        bridge: Arc<CompletionBridge>,
    ) -> Self {
        Self {
            worker_id,
            queue,
            queue_name: queue_name.into(),
            visibility_timeout,
            poll_interval,
            dispatcher,
            bridge,
        }
    }

    /// Receive and handle at most one message; `None` when the queue had nothing visible
    pub async fn process_next(&self) -> MessagingResult<Option<MessageDisposition>> {
        let Some(message) = self
            .queue
            .receive(&self.queue_name, self.visibility_timeout)
            .await?
        else {
            return Ok(None);
        };

        let disposition = self.handle(&message).await;
        match disposition {
            MessageDisposition::Acked => self.queue.ack(&self.queue_name, message.msg_id).await?,
            MessageDisposition::Archived => {
                self.queue
                    .archive(&self.queue_name, message.msg_id)
                    .await?
            }
            MessageDisposition::Released => {}
        }
        Ok(Some(disposition))
    }

    async fn handle(&self, message: &QueuedMessage) -> MessageDisposition {
        let envelope: DispatchEnvelope = match message.decode() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    worker_id = self.worker_id,
                    msg_id = message.msg_id,
                    error = %e,
                    "🗑️ DISPATCH: Archiving malformed dispatch message"
                );
                return MessageDisposition::Archived;
            }
        };

        let body = &envelope.body;
        match self.dispatcher.consume(&envelope).await {
            Ok(ConsumeOutcome::Dispatched { machine_id, .. }) => {
                debug!(
                    worker_id = self.worker_id,
                    execution_id = %body.execution_id,
                    step_id = %body.step_id,
                    machine_id = %machine_id,
                    "📨 DISPATCH: Step handed to backend"
                );
                MessageDisposition::Acked
            }
            Ok(ConsumeOutcome::Dropped { reason }) => {
                debug!(
                    worker_id = self.worker_id,
                    execution_id = %body.execution_id,
                    step_id = %body.step_id,
                    reason = %reason,
                    "🗑️ DISPATCH: Message dropped"
                );
                MessageDisposition::Acked
            }
            Err(e) if e.is_permanent() => {
                match self
                    .bridge
                    .fail_execution(
                        body.execution_id,
                        Some(body.step_execution_id),
                        &e.to_string(),
                    )
                    .await
                {
                    Ok(_) => MessageDisposition::Acked,
                    Err(fail_err) => {
                        error!(
                            worker_id = self.worker_id,
                            execution_id = %body.execution_id,
                            error = %fail_err,
                            "❌ DISPATCH: Could not record permanent failure, leaving message for redelivery"
                        );
                        MessageDisposition::Released
                    }
                }
            }
            Err(e) => match self.bridge.retry_dispatch(&envelope, &e.to_string()).await {
                Ok(_) => MessageDisposition::Acked,
                Err(retry_err) => {
                    error!(
                        worker_id = self.worker_id,
                        execution_id = %body.execution_id,
                        error = %retry_err,
                        "❌ DISPATCH: Could not schedule retry, leaving message for redelivery"
                    );
                    MessageDisposition::Released
                }
            },
        }
    }
}

#[async_trait]
impl QueueConsumer for DispatchWorker {
    fn name(&self) -> String {
        format!("dispatch-worker-{}", self.worker_id)
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> MessagingResult<()> {
        info!(
            worker_id = self.worker_id,
            queue = %self.queue_name,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "🚀 DISPATCH: Worker started"
        );

        while !is_shutdown(&shutdown) {
            if self.process_next().await?.is_none()
                && sleep_or_shutdown(&mut shutdown, self.poll_interval).await
            {
                break;
            }
        }
        Ok(())
    }
}
