//! # In-Memory Message Queue
//!
//! Thread-safe queue implementation for tests and local development.
//!
//! - **Visibility timeout**: messages become invisible after receive and re-visible
//!   after the timeout unless acked
//! - **Delayed send**: messages are stored immediately but hidden until their delay
//!   elapses
//! - **Manual clock**: [`InMemoryMessageQueue::advance_time`] moves the queue's notion
//!   of "now" forward so delays can be exercised without sleeping

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::errors::{MessagingError, MessagingResult};
use super::queue::{MessageQueue, QueuedMessage};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    payload: serde_json::Value,
    enqueued_at: DateTime<Utc>,
    /// When the message becomes visible (None = visible now)
    visible_at: Option<DateTime<Utc>>,
    read_count: i32,
}

#[derive(Debug, Default)]
struct InMemoryQueue {
    messages: VecDeque<StoredMessage>,
    archived: Vec<StoredMessage>,
    total_sent: u64,
    total_acked: u64,
}

#[derive(Debug)]
pub struct InMemoryMessageQueue {
    queues: RwLock<HashMap<String, InMemoryQueue>>,
    next_id: RwLock<i64>,
    clock_offset: RwLock<chrono::Duration>,
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            next_id: RwLock::new(1),
            clock_offset: RwLock::new(chrono::Duration::zero()),
        }
    }

    async fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.clock_offset.read().await
    }

    async fn allocate_id(&self) -> i64 {
        let mut next = self.next_id.write().await;
        let id = *next;
        *next += 1;
        id
    }

    async fn push(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay: Option<Duration>,
    ) -> MessagingResult<i64> {
        let now = self.now().await;
        let visible_at = match delay {
            Some(delay) => Some(
                now + chrono::Duration::from_std(delay)
                    .map_err(|e| MessagingError::internal(e.to_string()))?,
            ),
            None => None,
        };
        let id = self.allocate_id().await;

        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        queue.total_sent += 1;
        queue.messages.push_back(StoredMessage {
            id,
            payload: payload.clone(),
            enqueued_at: now,
            visible_at,
            read_count: 0,
        });

        Ok(id)
    }

    /// Move the queue clock forward, releasing delayed and timed-out messages.
    pub async fn advance_time(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        let mut offset = self.clock_offset.write().await;
        *offset += by;
    }

    /// Messages that are stored but not yet visible
    pub async fn hidden_count(&self, queue_name: &str) -> usize {
        let now = self.now().await;
        let queues = self.queues.read().await;
        queues
            .get(queue_name)
            .map(|q| {
                q.messages
                    .iter()
                    .filter(|m| m.visible_at.is_some_and(|at| at > now))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Payloads currently stored in a queue, oldest first
    pub async fn peek_all(&self, queue_name: &str) -> Vec<serde_json::Value> {
        let queues = self.queues.read().await;
        queues
            .get(queue_name)
            .map(|q| q.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn archived_count(&self, queue_name: &str) -> usize {
        let queues = self.queues.read().await;
        queues.get(queue_name).map(|q| q.archived.len()).unwrap_or(0)
    }

    pub async fn total_sent(&self, queue_name: &str) -> u64 {
        let queues = self.queues.read().await;
        queues.get(queue_name).map(|q| q.total_sent).unwrap_or(0)
    }

    pub async fn total_acked(&self, queue_name: &str) -> u64 {
        let queues = self.queues.read().await;
        queues.get(queue_name).map(|q| q.total_acked).unwrap_or(0)
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()> {
        let mut queues = self.queues.write().await;
        queues.entry(queue_name.to_string()).or_default();
        Ok(())
    }

    async fn send(&self, queue_name: &str, payload: &serde_json::Value) -> MessagingResult<i64> {
        self.push(queue_name, payload, None).await
    }

    async fn send_delayed(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay: Duration,
    ) -> MessagingResult<i64> {
        self.push(queue_name, payload, Some(delay)).await
    }

    async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> MessagingResult<Option<QueuedMessage>> {
        let now = self.now().await;
        let hidden_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .map_err(|e| MessagingError::internal(e.to_string()))?;

        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        let visible = queue
            .messages
            .iter_mut()
            .find(|m| m.visible_at.map(|at| at <= now).unwrap_or(true));

        Ok(visible.map(|message| {
            message.visible_at = Some(hidden_until);
            message.read_count += 1;
            QueuedMessage {
                msg_id: message.id,
                read_count: message.read_count,
                enqueued_at: message.enqueued_at,
                payload: message.payload.clone(),
            }
        }))
    }

    async fn ack(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        if let Some(pos) = queue.messages.iter().position(|m| m.id == msg_id) {
            queue.messages.remove(pos);
            queue.total_acked += 1;
        }
        Ok(())
    }

    async fn archive(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        let mut queues = self.queues.write().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        if let Some(pos) = queue.messages.iter().position(|m| m.id == msg_id) {
            if let Some(message) = queue.messages.remove(pos) {
                queue.archived.push(message);
            }
        }
        Ok(())
    }

    async fn queue_length(&self, queue_name: &str) -> MessagingResult<u64> {
        let queues = self.queues.read().await;
        queues
            .get(queue_name)
            .map(|q| q.messages.len() as u64)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))
    }
}
