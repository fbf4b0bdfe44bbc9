//! # Message Queue Abstraction
//!
//! Object-safe queue interface over JSON payloads. Typed helpers
//! ([`send_json`], [`QueuedMessage::decode`]) sit on top so the trait can be held as
//! `Arc<dyn MessageQueue>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use super::errors::{MessagingError, MessagingResult};

/// A message read from a queue and currently invisible to other readers
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub msg_id: i64,
    /// Number of times this message has been read, including this read
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl QueuedMessage {
    pub fn decode<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(MessagingError::from)
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Create the queue if it does not exist
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()>;

    async fn send(&self, queue_name: &str, payload: &serde_json::Value) -> MessagingResult<i64>;

    /// Send a message that becomes visible only after `delay`
    async fn send_delayed(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay: Duration,
    ) -> MessagingResult<i64>;

    /// Read at most one visible message, hiding it for `visibility_timeout`
    async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> MessagingResult<Option<QueuedMessage>>;

    /// Delete a processed message
    async fn ack(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()>;

    /// Move a message out of the live queue without processing it
    async fn archive(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()>;

    /// Messages currently stored, visible or not
    async fn queue_length(&self, queue_name: &str) -> MessagingResult<u64>;
}

pub async fn send_json<T: Serialize + Sync>(
    queue: &dyn MessageQueue,
    queue_name: &str,
    message: &T,
) -> MessagingResult<i64> {
    let payload = serde_json::to_value(message)?;
    queue.send(queue_name, &payload).await
}

pub async fn send_json_delayed<T: Serialize + Sync>(
    queue: &dyn MessageQueue,
    queue_name: &str,
    message: &T,
    delay: Duration,
) -> MessagingResult<i64> {
    let payload = serde_json::to_value(message)?;
    if delay.is_zero() {
        queue.send(queue_name, &payload).await
    } else {
        queue.send_delayed(queue_name, &payload, delay).await
    }
}

/// Queue names become table names in pgmq, so keep them to `[a-z0-9_]`.
pub fn validate_queue_name(queue_name: &str) -> MessagingResult<()> {
    if queue_name.is_empty() || queue_name.len() > 47 {
        return Err(MessagingError::invalid_queue_name(
            queue_name,
            "length must be between 1 and 47",
        ));
    }
    if !queue_name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(MessagingError::invalid_queue_name(
            queue_name,
            "only lowercase letters, digits and underscores are allowed",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_validation() {
        assert!(validate_queue_name("script_step_dispatch").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("Bad-Name").is_err());
        assert!(validate_queue_name("q; drop table x").is_err());
    }
}
