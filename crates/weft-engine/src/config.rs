use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use weft_executor::ExecutorConfig;
use weft_scheduler::SchedulerConfig;
use weft_worker::WorkerConfig;

/// A loop the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Executor,
  Worker,
  Scheduler,
}

/// Where executions and trigger state are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
  #[default]
  Memory,
  Sqlite { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub roles: Vec<Role>,
  /// Flow documents deployed at startup.
  pub flows_dir: Option<PathBuf>,
  /// Blob store root; blobs stay in memory when unset.
  pub blobs_dir: Option<PathBuf>,
  /// Environment variable prefix for `secret('NAME')`.
  pub secret_prefix: String,
  pub storage: StorageConfig,
  /// Worker loops started when the worker role is enabled.
  pub workers: usize,
  pub executor: ExecutorConfig,
  pub worker: WorkerConfig,
  pub scheduler: SchedulerConfig,
}

impl EngineConfig {
  pub fn runs(&self, role: Role) -> bool {
    self.roles.contains(&role)
  }
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      roles: vec![Role::Executor, Role::Worker, Role::Scheduler],
      flows_dir: None,
      blobs_dir: None,
      secret_prefix: "WEFT_SECRET_".to_string(),
      storage: StorageConfig::Memory,
      workers: 1,
      executor: ExecutorConfig::default(),
      worker: WorkerConfig::default(),
      scheduler: SchedulerConfig::default(),
    }
  }
}
