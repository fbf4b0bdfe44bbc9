//! # Messaging
//!
//! Queue plumbing for step dispatch and completion signals. Delivery is at-least-once:
//! consumers ack only after durable state has been updated, and every handler is
//! idempotent under redelivery.

pub mod errors;
pub mod in_memory;
pub mod message;
pub mod pgmq_queue;
pub mod publisher;
pub mod queue;

pub use errors::{MessagingError, MessagingResult};
pub use in_memory::InMemoryMessageQueue;
pub use message::{
    CompletionResult, CompletionSignal, DispatchEnvelope, DispatchHeaders, DispatchMessage,
};
pub use pgmq_queue::PgmqMessageQueue;
pub use publisher::{DispatchPublisher, RetryOutcome};
pub use queue::{send_json, MessageQueue, QueuedMessage};
