use std::fmt;
use std::time::Duration;

use crate::message::Message;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
  Ack,
  /// Make the message visible again after the delay.
  Retry(Duration),
}

/// Transport-specific acknowledgement handle.
pub trait Acker: Send {
  fn settle(self: Box<Self>, settlement: Settlement);
}

/// A message handed to a subscriber.
///
/// Dropping an unsettled delivery counts as a negative acknowledgement.
pub struct Delivery {
  message: Message,
  deliveries: u32,
  acker: Option<Box<dyn Acker>>,
}

impl Delivery {
  pub fn new(message: Message, deliveries: u32, acker: Box<dyn Acker>) -> Self {
    Self {
      message,
      deliveries,
      acker: Some(acker),
    }
  }

  pub fn message(&self) -> &Message {
    &self.message
  }

  /// How many times this message has been handed out, including this one.
  pub fn deliveries(&self) -> u32 {
    self.deliveries
  }

  pub fn ack(mut self) {
    self.settle(Settlement::Ack);
  }

  /// Redeliver immediately.
  pub fn nack(mut self) {
    self.settle(Settlement::Retry(Duration::ZERO));
  }

  pub fn retry_after(mut self, delay: Duration) {
    self.settle(Settlement::Retry(delay));
  }

  fn settle(&mut self, settlement: Settlement) {
    if let Some(acker) = self.acker.take() {
      acker.settle(settlement);
    }
  }
}

impl Drop for Delivery {
  fn drop(&mut self) {
    self.settle(Settlement::Retry(Duration::ZERO));
  }
}

impl fmt::Debug for Delivery {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Delivery")
      .field("message", &self.message.kind())
      .field("deliveries", &self.deliveries)
      .field("settled", &self.acker.is_none())
      .finish()
  }
}
