//! # PostgreSQL Message Queue (pgmq)
//!
//! [`MessageQueue`] backed by the pgmq extension. Shares the store's connection pool
//! so queue traffic and state updates go to the same database.

use async_trait::async_trait;
use pgmq::PGMQueue;
use std::time::Duration;
use tracing::{debug, info};

use super::errors::{MessagingError, MessagingResult};
use super::queue::{validate_queue_name, MessageQueue, QueuedMessage};

#[derive(Debug, Clone)]
pub struct PgmqMessageQueue {
    pgmq: PGMQueue,
}

impl PgmqMessageQueue {
    pub async fn new(database_url: &str) -> MessagingResult<Self> {
        info!("🚀 Connecting to pgmq");
        let pgmq = PGMQueue::new(database_url.to_string()).await?;
        info!("✅ Connected to pgmq");
        Ok(Self { pgmq })
    }

    /// Reuse an existing connection pool
    pub async fn new_with_pool(pool: sqlx::PgPool) -> Self {
        let pgmq = PGMQueue::new_with_pool(pool).await;
        debug!("✅ pgmq queue created with shared pool");
        Self { pgmq }
    }

    fn visibility_seconds(timeout: Duration) -> i32 {
        i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX)
    }
}

#[async_trait]
impl MessageQueue for PgmqMessageQueue {
    async fn ensure_queue(&self, queue_name: &str) -> MessagingResult<()> {
        validate_queue_name(queue_name)?;
        debug!("📋 Ensuring queue exists: {}", queue_name);

        self.pgmq
            .create(queue_name)
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "create", e.to_string()))?;
        Ok(())
    }

    async fn send(&self, queue_name: &str, payload: &serde_json::Value) -> MessagingResult<i64> {
        let msg_id = self
            .pgmq
            .send(queue_name, payload)
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "send", e.to_string()))?;

        debug!("📤 Message {} sent to queue: {}", msg_id, queue_name);
        Ok(msg_id)
    }

    async fn send_delayed(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay: Duration,
    ) -> MessagingResult<i64> {
        let msg_id = self
            .pgmq
            .send_delay(queue_name, payload, delay.as_secs())
            .await
            .map_err(|e| {
                MessagingError::queue_operation(queue_name, "send_delay", e.to_string())
            })?;

        debug!(
            "📤 Message {} sent to queue: {} (visible in {}s)",
            msg_id,
            queue_name,
            delay.as_secs()
        );
        Ok(msg_id)
    }

    async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> MessagingResult<Option<QueuedMessage>> {
        let message = self
            .pgmq
            .read::<serde_json::Value>(queue_name, Some(Self::visibility_seconds(visibility_timeout)))
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "read", e.to_string()))?;

        Ok(message.map(|m| QueuedMessage {
            msg_id: m.msg_id,
            read_count: m.read_ct,
            enqueued_at: m.enqueued_at,
            payload: m.message,
        }))
    }

    async fn ack(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        self.pgmq
            .delete(queue_name, msg_id)
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "delete", e.to_string()))?;
        debug!("🗑️ Message {} deleted from queue: {}", msg_id, queue_name);
        Ok(())
    }

    async fn archive(&self, queue_name: &str, msg_id: i64) -> MessagingResult<()> {
        self.pgmq
            .archive(queue_name, msg_id)
            .await
            .map_err(|e| MessagingError::queue_operation(queue_name, "archive", e.to_string()))?;
        debug!("📦 Message {} archived from queue: {}", msg_id, queue_name);
        Ok(())
    }

    async fn queue_length(&self, queue_name: &str) -> MessagingResult<u64> {
        validate_queue_name(queue_name)?;
        let sql = format!("SELECT COUNT(*) FROM pgmq.q_{queue_name}");
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pgmq.connection)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
