use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
  pub instance_id: String,
  /// Messages handled concurrently. Messages for one execution are always
  /// handled one at a time.
  pub parallelism: usize,
  /// A running task run without a heartbeat for this long is orphaned.
  pub heartbeat_grace_ms: u64,
  /// A requested attempt nobody started within this window is requeued.
  pub start_timeout_ms: u64,
  /// After this long in KILLING, remaining runs are marked KILLED.
  pub kill_grace_ms: u64,
  pub lease_ttl_ms: u64,
  /// Redelivery budget before a message is dead-lettered.
  pub max_deliveries: u32,
  pub orphan_scan_interval_ms: u64,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      instance_id: format!("executor-{}", uuid::Uuid::new_v4().simple()),
      parallelism: 16,
      heartbeat_grace_ms: 30_000,
      start_timeout_ms: 300_000,
      kill_grace_ms: 30_000,
      lease_ttl_ms: 30_000,
      max_deliveries: 5,
      orphan_scan_interval_ms: 5_000,
    }
  }
}
