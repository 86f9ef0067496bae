//! Weft Queue
//!
//! The roles of the engine never call each other: the scheduler, executor
//! and workers exchange [`Message`]s over a [`Queue`] with at-least-once
//! delivery.
//!
//! ```text
//!  scheduler ──ExecutionEvent──▶ executor ──TaskRunStart──▶ worker
//!                                   ▲                         │
//!                                   └──Started/Heartbeat/Ended┘
//! ```
//!
//! Subscribers in the same group compete for messages; every group sees
//! every message. A [`Delivery`] must be acknowledged: dropping it without
//! an ack redelivers the message, and a message delivered too many times is
//! moved to [`Topic::DeadLetter`].

mod delivery;
mod memory;
mod message;

use std::time::Duration;

use async_trait::async_trait;

pub use delivery::{Acker, Delivery, Settlement};
pub use memory::{DEFAULT_MAX_DELIVERIES, MemoryQueue};
pub use message::{
  CancelTaskRun, DeadLetter, ExecutionEvent, KillRequest, Message, PauseRequest, ResumeRequest,
  SpawnSubflow, TaskRunEnded, TaskRunHeartbeat, TaskRunStart, TaskRunStarted, Topic, attempt_key,
  decode, encode,
};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("queue is closed")]
  Closed,

  #[error("message serialization failed: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("unknown topic: {0}")]
  UnknownTopic(String),

  #[error("transport error: {message}")]
  Transport { message: String },
}

#[async_trait]
pub trait Queue: Send + Sync {
  async fn publish(&self, topic: Topic, message: Message) -> Result<(), QueueError>;

  /// Publish a message that becomes visible after `delay`.
  async fn publish_delayed(
    &self,
    topic: Topic,
    message: Message,
    delay: Duration,
  ) -> Result<(), QueueError>;

  async fn subscribe(&self, topic: Topic, group: &str) -> Result<Box<dyn Subscription>, QueueError>;
}

#[async_trait]
pub trait Subscription: Send {
  /// Wait for the next message; `None` once the queue is closed.
  async fn next(&mut self) -> Option<Delivery>;
}
