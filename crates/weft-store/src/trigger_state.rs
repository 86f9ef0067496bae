use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Identity of one trigger of one flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerKey {
  pub namespace: String,
  pub flow_id: String,
  pub trigger_id: String,
}

impl TriggerKey {
  pub fn new(
    namespace: impl Into<String>,
    flow_id: impl Into<String>,
    trigger_id: impl Into<String>,
  ) -> Self {
    Self {
      namespace: namespace.into(),
      flow_id: flow_id.into(),
      trigger_id: trigger_id.into(),
    }
  }
}

impl fmt::Display for TriggerKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}/{}", self.namespace, self.flow_id, self.trigger_id)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FireRecord {
  pub fire_key: String,
  pub fired_at: DateTime<Utc>,
}

/// A fire that was recorded but not yet confirmed as published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFire {
  pub execution_id: String,
  pub fire_key: String,
  /// The serialized message to (re)publish.
  pub message: serde_json::Value,
}

/// Everything the scheduler remembers about a trigger between ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerState {
  pub key: TriggerKey,
  #[serde(default)]
  pub version: u64,
  /// Schedule triggers store the last fire instant; poll triggers store
  /// whatever the plugin returned.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub watermark: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_evaluated_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub fired: Vec<FireRecord>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pending: Option<PendingFire>,
}

impl TriggerState {
  pub fn new(key: TriggerKey) -> Self {
    Self {
      key,
      version: 0,
      watermark: None,
      last_evaluated_at: None,
      fired: Vec::new(),
      pending: None,
    }
  }

  /// Whether `fire_key` already fired within `window` of `now`.
  pub fn fired_within(&self, fire_key: &str, window: TimeDelta, now: DateTime<Utc>) -> bool {
    self
      .fired
      .iter()
      .any(|r| r.fire_key == fire_key && now - r.fired_at < window)
  }

  pub fn record_fire(&mut self, fire_key: impl Into<String>, now: DateTime<Utc>) {
    self.fired.push(FireRecord {
      fire_key: fire_key.into(),
      fired_at: now,
    });
  }

  /// Forget fires older than `window`.
  pub fn prune(&mut self, window: TimeDelta, now: DateTime<Utc>) {
    self.fired.retain(|r| now - r.fired_at < window);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_dedup_window() {
    let now = Utc::now();
    let mut state = TriggerState::new(TriggerKey::new("ns", "f", "t"));
    state.record_fire("k1", now);

    let window = TimeDelta::minutes(5);
    assert!(state.fired_within("k1", window, now + TimeDelta::minutes(4)));
    assert!(!state.fired_within("k1", window, now + TimeDelta::minutes(5)));
    assert!(!state.fired_within("k2", window, now));

    state.prune(window, now + TimeDelta::minutes(6));
    assert!(state.fired.is_empty());
  }
}
