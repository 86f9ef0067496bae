use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  pub instance_id: String,
  pub tick_interval_ms: u64,
  /// Trigger ownership lifetime; an instance that stops ticking loses its
  /// triggers after this long.
  pub lease_ttl_ms: u64,
  /// Dedup window for triggers that declare none.
  pub default_dedup_window_ms: u64,
  pub evaluation_timeout_ms: u64,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      instance_id: format!("scheduler-{}", uuid::Uuid::new_v4().simple()),
      tick_interval_ms: 1_000,
      lease_ttl_ms: 15_000,
      default_dedup_window_ms: 60 * 60 * 1000,
      evaluation_timeout_ms: 30_000,
    }
  }
}
