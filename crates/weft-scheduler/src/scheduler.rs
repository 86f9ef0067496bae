use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, json};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use weft_flow::{Flow, FlowRepository, TriggerNode, next_fire_after, parse_cron};
use weft_plugin::{TriggerPolicy, TriggerRequest, TriggerSeed};
use weft_queue::{ExecutionEvent, Message, Queue, Topic};
use weft_store::{
  Clock, ExecutionState, LeaseStore, PendingFire, TriggerKey, TriggerKind, TriggerState,
  TriggerStateStore, TriggeringContext,
};
use weft_worker::TriggerRunner;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

/// Upper bound on missed schedule occurrences skipped in one tick.
const MAX_CATCH_UP: u32 = 1_000;

pub struct Scheduler {
  config: SchedulerConfig,
  flows: Arc<FlowRepository>,
  states: Arc<dyn TriggerStateStore>,
  leases: Arc<dyn LeaseStore>,
  queue: Arc<dyn Queue>,
  runner: TriggerRunner,
  clock: Clock,
}

impl Scheduler {
  pub fn new(
    config: SchedulerConfig,
    flows: Arc<FlowRepository>,
    states: Arc<dyn TriggerStateStore>,
    leases: Arc<dyn LeaseStore>,
    queue: Arc<dyn Queue>,
    clock: Clock,
  ) -> Self {
    let runner = TriggerRunner::new(Duration::from_millis(config.evaluation_timeout_ms));
    Self {
      config,
      flows,
      states,
      leases,
      queue,
      runner,
      clock,
    }
  }

  /// Tick until `cancel` fires.
  pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
    info!(instance_id = %self.config.instance_id, "scheduler started");

    let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = ticker.tick() => {
          self.tick().await;
        }
      }
    }

    info!(instance_id = %self.config.instance_id, "scheduler stopped");
  }

  /// Evaluate every active trigger once. Returns the number of executions
  /// fired.
  pub async fn tick(&self) -> usize {
    let mut fired = 0;
    for flow in self.flows.list_latest().await {
      if flow.disabled {
        continue;
      }
      for trigger in flow.triggers.iter().filter(|t| !t.disabled) {
        match self.evaluate(&flow, trigger).await {
          Ok(true) => fired += 1,
          Ok(false) => {}
          Err(e) => warn!(
            namespace = %flow.namespace,
            flow_id = %flow.id,
            trigger_id = %trigger.id,
            error = %e,
            "trigger evaluation failed"
          ),
        }
      }
    }
    fired
  }

  #[instrument(
    name = "trigger_tick",
    skip(self, flow, trigger),
    fields(namespace = %flow.namespace, flow_id = %flow.id, trigger_id = %trigger.id)
  )]
  async fn evaluate(&self, flow: &Flow, trigger: &TriggerNode) -> Result<bool, SchedulerError> {
    let key = TriggerKey::new(&flow.namespace, &flow.id, &trigger.id);
    let ttl = Duration::from_millis(self.config.lease_ttl_ms);
    let lease = self
      .leases
      .acquire(&format!("trigger/{key}"), &self.config.instance_id, ttl)
      .await?;
    if lease.is_none() {
      return Ok(false);
    }

    let mut state = match self.states.get(&key).await? {
      Some(state) => state,
      None => TriggerState::new(key.clone()),
    };
    if let Some(pending) = state.pending.clone() {
      self.republish(&mut state, pending).await?;
    }
    let original = state.clone();

    let now = self.clock.now();
    let window = trigger
      .dedup_window
      .unwrap_or(Duration::from_millis(self.config.default_dedup_window_ms));
    let window = TimeDelta::from_std(window).unwrap_or_else(|_| TimeDelta::days(365));
    state.prune(window, now);

    let (seed, kind) = match &trigger.policy {
      TriggerPolicy::Schedule { cron } => (
        due_occurrence(&mut state, &trigger.id, cron, now),
        TriggerKind::Schedule,
      ),
      TriggerPolicy::Poll { interval } => (
        self.poll(&mut state, flow, trigger, *interval, now).await,
        TriggerKind::Event,
      ),
    };
    let seed = match seed {
      Ok(Some(seed)) => seed,
      Ok(None) => {
        self.save_if_changed(&original, &mut state).await?;
        return Ok(false);
      }
      Err(e) => {
        self.save_if_changed(&original, &mut state).await?;
        return Err(e);
      }
    };

    if state.fired_within(&seed.fire_key, window, now) {
      info!(fire_key = %seed.fire_key, "trigger fire deduplicated");
      if let Some(watermark) = seed.watermark {
        state.watermark = Some(watermark);
      }
      self.save_if_changed(&original, &mut state).await?;
      return Ok(false);
    }

    let execution_id = Uuid::new_v4().to_string();
    let message = Message::ExecutionEvent(ExecutionEvent {
      execution_id: execution_id.clone(),
      flow: flow.reference(),
      state: ExecutionState::Created,
      trigger: TriggeringContext {
        kind,
        trigger_id: Some(trigger.id.clone()),
        fire_key: Some(seed.fire_key.clone()),
        payload: seed.payload,
      },
      inputs: Map::new(),
      parent: None,
    });

    state.record_fire(&seed.fire_key, now);
    if let Some(watermark) = seed.watermark {
      state.watermark = Some(watermark);
    }
    state.pending = Some(PendingFire {
      execution_id: execution_id.clone(),
      fire_key: seed.fire_key.clone(),
      message: serde_json::to_value(&message)?,
    });
    self.states.save(&mut state).await?;

    self.queue.publish(Topic::Executor, message).await?;
    state.pending = None;
    self.states.save(&mut state).await?;

    info!(execution_id = %execution_id, fire_key = %seed.fire_key, "trigger fired");
    Ok(true)
  }

  async fn republish(
    &self,
    state: &mut TriggerState,
    pending: PendingFire,
  ) -> Result<(), SchedulerError> {
    warn!(
      execution_id = %pending.execution_id,
      fire_key = %pending.fire_key,
      "republishing pending trigger fire"
    );
    let message: Message = serde_json::from_value(pending.message)?;
    self.queue.publish(Topic::Executor, message).await?;
    state.pending = None;
    self.states.save(state).await?;
    Ok(())
  }

  async fn poll(
    &self,
    state: &mut TriggerState,
    flow: &Flow,
    trigger: &TriggerNode,
    interval: Duration,
    now: DateTime<Utc>,
  ) -> Result<Option<TriggerSeed>, SchedulerError> {
    if let Some(last) = state.last_evaluated_at {
      let interval = TimeDelta::from_std(interval).unwrap_or_else(|_| TimeDelta::zero());
      if now - last < interval {
        return Ok(None);
      }
    }
    state.last_evaluated_at = Some(now);

    let request = TriggerRequest {
      namespace: flow.namespace.clone(),
      flow_id: flow.id.clone(),
      trigger_id: trigger.id.clone(),
      now,
      watermark: state.watermark.clone(),
    };
    self
      .runner
      .evaluate(trigger.plugin.as_ref(), &request, &trigger.config)
      .await
      .map_err(|source| SchedulerError::Evaluation {
        trigger: trigger.id.clone(),
        source,
      })
  }

  async fn save_if_changed(
    &self,
    original: &TriggerState,
    state: &mut TriggerState,
  ) -> Result<(), SchedulerError> {
    if state != original {
      self.states.save(state).await?;
    }
    Ok(())
  }
}

/// The latest schedule occurrence since the watermark that is due by `now`.
///
/// A trigger seen for the first time starts from `now` and does not fire.
fn due_occurrence(
  state: &mut TriggerState,
  trigger_id: &str,
  cron: &str,
  now: DateTime<Utc>,
) -> Result<Option<TriggerSeed>, SchedulerError> {
  let schedule = parse_cron(cron).map_err(|message| SchedulerError::Schedule {
    trigger: trigger_id.to_string(),
    message,
  })?;

  let last = state
    .watermark
    .as_ref()
    .and_then(|w| w.as_str())
    .and_then(|w| DateTime::parse_from_rfc3339(w).ok())
    .map(|w| w.with_timezone(&Utc));
  let Some(mut cursor) = last else {
    state.watermark = Some(json!(now.to_rfc3339()));
    return Ok(None);
  };

  let mut due = None;
  let mut missed = 0;
  while let Some(next) = next_fire_after(&schedule, cursor) {
    if next > now {
      break;
    }
    if due.is_some() {
      missed += 1;
    }
    due = Some(next);
    cursor = next;
    if missed >= MAX_CATCH_UP {
      break;
    }
  }

  let Some(at) = due else {
    return Ok(None);
  };
  if missed > 0 {
    warn!(missed, "skipped missed schedule occurrences");
  }

  let stamp = at.to_rfc3339();
  Ok(Some(TriggerSeed {
    fire_key: stamp.clone(),
    payload: json!({ "date": stamp }),
    watermark: Some(json!(stamp)),
  }))
}
