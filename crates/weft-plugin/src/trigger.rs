use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, TriggerError};
use crate::info::Plugin;

/// How the scheduler decides when to look at a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerPolicy {
  /// Fire at every occurrence of a cron expression. The scheduler computes
  /// fire instants itself; [`Trigger::evaluate`] is not called.
  Schedule { cron: String },
  /// Call [`Trigger::evaluate`] at most once per `interval`.
  Poll { interval: Duration },
}

/// Input handed to [`Trigger::evaluate`].
#[derive(Debug, Clone)]
pub struct TriggerRequest {
  pub namespace: String,
  pub flow_id: String,
  pub trigger_id: String,
  /// Evaluation instant.
  pub now: DateTime<Utc>,
  /// Watermark persisted after the previous positive evaluation.
  pub watermark: Option<serde_json::Value>,
}

/// A positive trigger evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSeed {
  /// Identifies the logical event; two seeds with the same key inside the
  /// trigger's dedup window produce a single execution.
  pub fire_key: String,
  /// Exposed to the execution as `trigger`.
  #[serde(default)]
  pub payload: serde_json::Value,
  /// New watermark to persist before the execution is published.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub watermark: Option<serde_json::Value>,
}

/// A condition evaluator that seeds new executions.
#[async_trait]
pub trait Trigger: Plugin {
  /// Evaluation policy derived from the trigger's configuration.
  fn policy(&self, config: &serde_json::Value) -> Result<TriggerPolicy, PluginError>;

  /// Poll the outside world.
  ///
  /// Must be side-effect-idempotent for a given watermark: evaluating twice
  /// with the same watermark must not consume anything the second call would
  /// need to see.
  async fn evaluate(
    &self,
    _request: &TriggerRequest,
    _config: &serde_json::Value,
  ) -> Result<Option<TriggerSeed>, TriggerError> {
    Ok(None)
  }
}
