//! # Dispatch Publisher
//!
//! Owns the dispatch queue's retry contract: first publication, republish with
//! backoff after a transient failure, and dead-lettering once the retry budget is spent.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::errors::MessagingResult;
use super::message::{DispatchEnvelope, DispatchMessage};
use super::queue::{send_json, send_json_delayed, MessageQueue};
use crate::config::{QueueConfig, RetryConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Republished with an incremented retry count, visible after `delay`
    Retried {
        msg_id: i64,
        retry_count: u32,
        delay: Duration,
    },
    /// Budget exhausted; the envelope now sits on the dead-letter queue
    DeadLettered { msg_id: i64, failures: u32 },
}

#[derive(Clone)]
pub struct DispatchPublisher {
    queue: Arc<dyn MessageQueue>,
    queues: QueueConfig,
    retry: RetryConfig,
}

impl std::fmt::Debug for DispatchPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPublisher")
            .field("queues", &self.queues)
            .field("retry", &self.retry)
            .finish()
    }
}

impl DispatchPublisher {
    pub fn new(queue: Arc<dyn MessageQueue>, queues: QueueConfig, retry: RetryConfig) -> Self {
        Self {
            queue,
            queues,
            retry,
        }
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    pub fn queue_names(&self) -> &QueueConfig {
        &self.queues
    }

    /// Create the dispatch, dead-letter and completion queues
    pub async fn ensure_queues(&self) -> MessagingResult<()> {
        for name in [
            &self.queues.step_dispatch,
            &self.queues.dead_letter,
            &self.queues.completions,
        ] {
            self.queue.ensure_queue(name).await?;
        }
        Ok(())
    }

    /// First publication of a step's dispatch message
    pub async fn publish(&self, message: DispatchMessage) -> MessagingResult<i64> {
        let envelope = DispatchEnvelope::new(message);
        let msg_id = send_json(self.queue.as_ref(), &self.queues.step_dispatch, &envelope).await?;

        info!(
            execution_id = %envelope.body.execution_id,
            step_id = %envelope.body.step_id,
            step_order = envelope.body.step_order,
            msg_id = msg_id,
            "📤 DISPATCH: Step enqueued"
        );
        Ok(msg_id)
    }

    /// Handle one failed delivery of `envelope`: republish after the scheduled
    /// delay, or route to the dead-letter queue when this failure exhausts the budget.
    pub async fn retry_or_dead_letter(
        &self,
        envelope: &DispatchEnvelope,
        reason: &str,
    ) -> MessagingResult<RetryOutcome> {
        let retry_count = envelope.retry_count();
        let next = envelope.next_attempt(reason);

        if self.retry.is_exhausted(retry_count) {
            let msg_id = send_json(self.queue.as_ref(), &self.queues.dead_letter, &next).await?;
            warn!(
                execution_id = %envelope.body.execution_id,
                step_id = %envelope.body.step_id,
                failures = next.retry_count(),
                reason = reason,
                "☠️ DISPATCH: Retries exhausted, message dead-lettered"
            );
            return Ok(RetryOutcome::DeadLettered {
                msg_id,
                failures: next.retry_count(),
            });
        }

        let delay = self.retry.delay_for(retry_count);
        let msg_id = send_json_delayed(
            self.queue.as_ref(),
            &self.queues.step_dispatch,
            &next,
            delay,
        )
        .await?;

        info!(
            execution_id = %envelope.body.execution_id,
            step_id = %envelope.body.step_id,
            retry_count = next.retry_count(),
            delay_seconds = delay.as_secs(),
            reason = reason,
            "🔄 DISPATCH: Step republished with backoff"
        );
        Ok(RetryOutcome::Retried {
            msg_id,
            retry_count: next.retry_count(),
            delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryMessageQueue;
    use uuid::Uuid;

    async fn publisher() -> (Arc<InMemoryMessageQueue>, DispatchPublisher) {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let publisher = DispatchPublisher::new(
            queue.clone(),
            QueueConfig::default(),
            RetryConfig::default(),
        );
        publisher.ensure_queues().await.unwrap();
        (queue, publisher)
    }

    fn message() -> DispatchMessage {
        DispatchMessage {
            execution_id: Uuid::new_v4(),
            step_execution_id: Uuid::new_v4(),
            step_id: "step-a".to_string(),
            step_order: 0,
        }
    }

    #[tokio::test]
    async fn test_backoff_schedule_then_dead_letter() {
        let (queue, publisher) = publisher().await;
        let names = QueueConfig::default();

        let first = DispatchEnvelope::new(message());
        let outcome = publisher.retry_or_dead_letter(&first, "timeout").await.unwrap();
        assert!(matches!(
            outcome,
            RetryOutcome::Retried { retry_count: 1, delay, .. } if delay == Duration::from_secs(10)
        ));

        let second = first.next_attempt("timeout");
        let outcome = publisher.retry_or_dead_letter(&second, "timeout").await.unwrap();
        assert!(matches!(
            outcome,
            RetryOutcome::Retried { retry_count: 2, delay, .. } if delay == Duration::from_secs(20)
        ));

        let third = second.next_attempt("timeout");
        let outcome = publisher.retry_or_dead_letter(&third, "timeout").await.unwrap();
        assert!(matches!(outcome, RetryOutcome::DeadLettered { failures: 3, .. }));

        let dead = queue.peek_all(&names.dead_letter).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0]["headers"]["x-retry-count"], serde_json::json!(3));
        assert_eq!(dead[0]["body"]["stepId"], serde_json::json!("step-a"));
    }
}
