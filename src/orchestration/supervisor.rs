//! # Worker Supervision
//!
//! Queue consumers run as long-lived tasks. A consumer returns an error only for
//! transport-level trouble (the queue itself is unreachable); the supervisor then
//! waits a fixed backoff and resubscribes. This is separate from message-level
//! retry, which the consumers handle themselves.
//!
//! Shutdown is signalled through a `tokio::sync::watch` channel: sending `true` (or
//! dropping the sender) stops every worker at its next poll.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::messaging::MessagingResult;

#[async_trait]
pub trait QueueConsumer: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Consume until shutdown; `Err` means the subscription was lost
    async fn run(&self, shutdown: watch::Receiver<bool>) -> MessagingResult<()>;
}

pub fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Wait for `duration` or until shutdown is signalled; returns `true` on shutdown.
pub async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(duration) => false,
    }
}

pub fn spawn_supervised<C: QueueConsumer>(
    consumer: Arc<C>,
    resubscribe_backoff: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = consumer.name();
        let mut shutdown = shutdown;
        let mut restarts: u64 = 0;

        loop {
            if is_shutdown(&shutdown) {
                break;
            }
            info!(worker = %name, restarts = restarts, "▶️ SUPERVISOR: Worker subscribed");

            match consumer.run(shutdown.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    restarts += 1;
                    warn!(
                        worker = %name,
                        error = %e,
                        backoff_ms = resubscribe_backoff.as_millis() as u64,
                        "🔌 SUPERVISOR: Worker lost its subscription, resubscribing after backoff"
                    );
                    if sleep_or_shutdown(&mut shutdown, resubscribe_backoff).await {
                        break;
                    }
                }
            }
        }
        info!(worker = %name, "⏹️ SUPERVISOR: Worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessagingError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyConsumer {
        runs: AtomicUsize,
        failures_before_success: usize,
    }

    #[async_trait]
    impl QueueConsumer for FlakyConsumer {
        fn name(&self) -> String {
            "flaky".to_string()
        }

        async fn run(&self, mut shutdown: watch::Receiver<bool>) -> MessagingResult<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.failures_before_success {
                return Err(MessagingError::database("receive", "queue unreachable"));
            }
            while !is_shutdown(&shutdown) {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_resubscribes_after_transport_failure() {
        let consumer = Arc::new(FlakyConsumer {
            runs: AtomicUsize::new(0),
            failures_before_success: 2,
        });
        let (tx, rx) = watch::channel(false);
        let handle = spawn_supervised(consumer.clone(), Duration::from_millis(5), rx);

        tokio::time::timeout(Duration::from_secs(2), async {
            while consumer.runs.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(consumer.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let consumer = Arc::new(FlakyConsumer {
            runs: AtomicUsize::new(0),
            failures_before_success: usize::MAX,
        });
        let (tx, rx) = watch::channel(false);
        let handle = spawn_supervised(consumer.clone(), Duration::from_secs(3600), rx);

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(consumer.runs.load(Ordering::SeqCst), 1);
    }
}
