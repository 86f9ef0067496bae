use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::delivery::{Acker, Delivery, Settlement};
use crate::message::{DeadLetter, Message, Topic, decode, encode};
use crate::{Queue, QueueError, Subscription};

pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// In-process [`Queue`].
///
/// Messages are stored encoded, the way an external broker would hold them.
/// Messages published before any group subscribed to a topic are kept and
/// handed to the first group that does.
#[derive(Clone)]
pub struct MemoryQueue {
  inner: Arc<Inner>,
}

struct Inner {
  state: Mutex<State>,
  max_deliveries: u32,
  closed: CancellationToken,
}

#[derive(Default)]
struct State {
  topics: HashMap<Topic, TopicState>,
}

#[derive(Default)]
struct TopicState {
  backlog: VecDeque<(Option<Instant>, Envelope)>,
  groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
  ready: VecDeque<Envelope>,
  delayed: Vec<(Instant, Envelope)>,
  notify: Arc<Notify>,
}

#[derive(Clone)]
struct Envelope {
  payload: Bytes,
  deliveries: u32,
}

impl Group {
  fn push(&mut self, due: Option<Instant>, envelope: Envelope) {
    match due {
      Some(at) => self.delayed.push((at, envelope)),
      None => self.ready.push_back(envelope),
    }
    self.notify.notify_one();
  }

  /// The next visible envelope, or when the next delayed one is due.
  fn take(&mut self, now: Instant) -> Result<Envelope, Option<Instant>> {
    if !self.delayed.is_empty() {
      self.delayed.sort_by_key(|(at, _)| *at);
      let due = self.delayed.iter().take_while(|(at, _)| *at <= now).count();
      self
        .ready
        .extend(self.delayed.drain(..due).map(|(_, envelope)| envelope));
    }
    self
      .ready
      .pop_front()
      .ok_or_else(|| self.delayed.first().map(|(at, _)| *at))
  }

  fn depth(&self) -> usize {
    self.ready.len() + self.delayed.len()
  }
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::with_max_deliveries(DEFAULT_MAX_DELIVERIES)
  }

  pub fn with_max_deliveries(max_deliveries: u32) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::default(),
        max_deliveries: max_deliveries.max(1),
        closed: CancellationToken::new(),
      }),
    }
  }

  /// Stop handing out messages. Pending `next` calls return `None`.
  pub fn close(&self) {
    self.inner.closed.cancel();
  }

  /// Messages waiting for `group` on `topic`, not counting ones in flight.
  pub fn depth(&self, topic: Topic, group: &str) -> usize {
    let state = self.inner.lock();
    state
      .topics
      .get(&topic)
      .and_then(|t| t.groups.get(group))
      .map(Group::depth)
      .unwrap_or(0)
  }
}

impl Default for MemoryQueue {
  fn default() -> Self {
    Self::new()
  }
}

impl Inner {
  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn enqueue(&self, topic: Topic, envelope: Envelope, delay: Duration) {
    let due = (!delay.is_zero()).then(|| Instant::now() + delay);
    let mut state = self.lock();
    let topic_state = state.topics.entry(topic).or_default();
    if topic_state.groups.is_empty() {
      topic_state.backlog.push_back((due, envelope));
      return;
    }
    for group in topic_state.groups.values_mut() {
      group.push(due, envelope.clone());
    }
  }

  fn redeliver(&self, topic: Topic, group: &str, envelope: Envelope, delay: Duration) {
    if envelope.deliveries >= self.max_deliveries {
      self.dead_letter(topic, envelope);
      return;
    }
    let due = (!delay.is_zero()).then(|| Instant::now() + delay);
    let mut state = self.lock();
    if let Some(group) = state
      .topics
      .get_mut(&topic)
      .and_then(|t| t.groups.get_mut(group))
    {
      group.push(due, envelope);
    }
  }

  fn dead_letter(&self, topic: Topic, envelope: Envelope) {
    let deliveries = envelope.deliveries;
    if topic == Topic::DeadLetter {
      error!(deliveries, "dropping undeliverable dead letter");
      return;
    }

    let dead = decode(&envelope.payload).and_then(|message| {
      warn!(
        topic = %topic,
        kind = message.kind(),
        execution_id = %message.execution_id(),
        deliveries,
        "message dead-lettered"
      );
      encode(&Message::DeadLetter(DeadLetter {
        topic,
        deliveries,
        message: Box::new(message),
      }))
    });

    match dead {
      Ok(payload) => self.enqueue(
        Topic::DeadLetter,
        Envelope {
          payload: Bytes::from(payload),
          deliveries: 0,
        },
        Duration::ZERO,
      ),
      Err(e) => error!(topic = %topic, error = %e, "failed to dead-letter message"),
    }
  }
}

#[async_trait]
impl Queue for MemoryQueue {
  async fn publish(&self, topic: Topic, message: Message) -> Result<(), QueueError> {
    self.publish_delayed(topic, message, Duration::ZERO).await
  }

  async fn publish_delayed(
    &self,
    topic: Topic,
    message: Message,
    delay: Duration,
  ) -> Result<(), QueueError> {
    if self.inner.closed.is_cancelled() {
      return Err(QueueError::Closed);
    }
    let envelope = Envelope {
      payload: Bytes::from(encode(&message)?),
      deliveries: 0,
    };
    self.inner.enqueue(topic, envelope, delay);
    Ok(())
  }

  async fn subscribe(&self, topic: Topic, group: &str) -> Result<Box<dyn Subscription>, QueueError> {
    if self.inner.closed.is_cancelled() {
      return Err(QueueError::Closed);
    }

    let notify = {
      let mut state = self.inner.lock();
      let topic_state = state.topics.entry(topic).or_default();
      let first = topic_state.groups.is_empty();
      let backlog = if first {
        std::mem::take(&mut topic_state.backlog)
      } else {
        VecDeque::new()
      };
      let entry = topic_state.groups.entry(group.to_string()).or_default();
      for (due, envelope) in backlog {
        entry.push(due, envelope);
      }
      entry.notify.clone()
    };

    Ok(Box::new(MemorySubscription {
      inner: self.inner.clone(),
      topic,
      group: group.to_string(),
      notify,
    }))
  }
}

struct MemorySubscription {
  inner: Arc<Inner>,
  topic: Topic,
  group: String,
  notify: Arc<Notify>,
}

#[async_trait]
impl Subscription for MemorySubscription {
  async fn next(&mut self) -> Option<Delivery> {
    loop {
      if self.inner.closed.is_cancelled() {
        return None;
      }

      let next_due = {
        let mut state = self.inner.lock();
        let group = state
          .topics
          .get_mut(&self.topic)
          .and_then(|t| t.groups.get_mut(&self.group))?;
        match group.take(Instant::now()) {
          Ok(mut envelope) => {
            envelope.deliveries += 1;
            match decode(&envelope.payload) {
              Ok(message) => {
                let deliveries = envelope.deliveries;
                let acker = MemoryAcker {
                  inner: self.inner.clone(),
                  topic: self.topic,
                  group: self.group.clone(),
                  envelope,
                };
                return Some(Delivery::new(message, deliveries, Box::new(acker)));
              }
              Err(e) => {
                error!(topic = %self.topic, error = %e, "dropping undecodable message");
                continue;
              }
            }
          }
          Err(next_due) => next_due,
        }
      };

      tokio::select! {
        _ = self.inner.closed.cancelled() => return None,
        _ = self.notify.notified() => {}
        _ = sleep_until(next_due) => {}
      }
    }
  }
}

async fn sleep_until(at: Option<Instant>) {
  match at {
    Some(at) => tokio::time::sleep_until(at).await,
    None => std::future::pending().await,
  }
}

struct MemoryAcker {
  inner: Arc<Inner>,
  topic: Topic,
  group: String,
  envelope: Envelope,
}

impl Acker for MemoryAcker {
  fn settle(self: Box<Self>, settlement: Settlement) {
    match settlement {
      Settlement::Ack => {}
      Settlement::Retry(delay) => {
        let MemoryAcker {
          inner,
          topic,
          group,
          envelope,
        } = *self;
        inner.redeliver(topic, &group, envelope, delay);
      }
    }
  }
}
