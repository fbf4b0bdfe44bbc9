//! # Completion Listener
//!
//! Reads [`CompletionSignal`]s from the completion queue and routes them to the
//! [`CompletionBridge`]. Malformed signals are archived; a signal whose handling
//! fails is left for redelivery.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::completion_bridge::{CompletionBridge, CompletionOutcome};
use super::dispatch_worker::MessageDisposition;
use super::supervisor::{is_shutdown, sleep_or_shutdown, QueueConsumer};
use crate::messaging::{CompletionSignal, MessageQueue, MessagingResult, QueuedMessage};

pub struct CompletionListener {
    queue: Arc<dyn MessageQueue>,
    queue_name: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
    bridge: Arc<CompletionBridge>,
}

impl CompletionListener {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        queue_name: impl Into<String>,
        visibility_timeout: Duration,
        poll_interval: Duration,
        bridge: Arc<CompletionBridge>,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            visibility_timeout,
            poll_interval,
            bridge,
        }
    }

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
        let signal: CompletionSignal = match message.decode() {
            Ok(signal) => signal,
            Err(e) => {
                warn!(
                    msg_id = message.msg_id,
                    error = %e,
                    "🗑️ COMPLETION: Archiving malformed completion signal"
                );
                return MessageDisposition::Archived;
            }
        };

        match self.bridge.handle_signal(&signal).await {
            Ok(outcome) => {
                if let CompletionOutcome::Ignored { reason } = &outcome {
                    debug!(
                        execution_id = %signal.execution_id,
                        step_id = %signal.step_id,
                        reason = %reason,
                        "🗑️ COMPLETION: Signal ignored"
                    );
                }
                MessageDisposition::Acked
            }
            Err(e) => {
                error!(
                    execution_id = %signal.execution_id,
                    step_id = %signal.step_id,
                    result = %signal.result,
                    error = %e,
                    "❌ COMPLETION: Failed to handle signal, releasing it for redelivery"
                );
                MessageDisposition::Released
            }
        }
    }
}

#[async_trait]
impl QueueConsumer for CompletionListener {
    fn name(&self) -> String {
        "completion-listener".to_string()
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> MessagingResult<()> {
        info!(queue = %self.queue_name, "🚀 COMPLETION: Listener started");

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
