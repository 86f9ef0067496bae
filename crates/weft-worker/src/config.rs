use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  pub worker_id: String,
  /// Task runs executed concurrently.
  pub parallelism: usize,
  pub heartbeat_interval_ms: u64,
  /// Applied when a task declares no timeout.
  pub default_timeout_ms: Option<u64>,
  pub max_inline_output_bytes: usize,
  /// Lifetime of an attempt claim between heartbeats.
  pub lease_ttl_ms: u64,
  /// How long a finished attempt stays claimed so redeliveries are ignored.
  pub claim_retention_ms: u64,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      worker_id: format!("worker-{}", uuid::Uuid::new_v4().simple()),
      parallelism: 8,
      heartbeat_interval_ms: 5_000,
      default_timeout_ms: None,
      max_inline_output_bytes: 64 * 1024,
      lease_ttl_ms: 30_000,
      claim_retention_ms: 24 * 60 * 60 * 1000,
    }
  }
}
