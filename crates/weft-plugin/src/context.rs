use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// Severity of a log line emitted by a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
}

/// The environment a task sees while it runs.
///
/// The engine provides one implementation per task-run attempt; plugins only
/// ever see this trait, which keeps the plugin contract free of engine types.
#[async_trait]
pub trait TaskContext: Send + Sync {
  fn execution_id(&self) -> &str;

  fn task_id(&self) -> &str;

  /// Iteration index for tasks expanded with `forEach` (0 otherwise).
  fn iteration(&self) -> u32;

  /// Attempt number, starting at 1.
  fn attempt(&self) -> u32;

  /// The variable scope templates are rendered against.
  fn variables(&self) -> &serde_json::Value;

  /// Render a template string against [`TaskContext::variables`].
  fn render(&self, template: &str) -> Result<String, TaskError>;

  /// Render every string inside `value`, leaving other JSON types untouched.
  fn render_value(&self, value: &serde_json::Value) -> Result<serde_json::Value, TaskError>;

  /// Record a log line for this run.
  fn log(&self, level: LogLevel, message: &str);

  /// Token that fires when the run is killed.
  fn cancellation(&self) -> CancellationToken;

  /// Store `data` in the blob store, returning its URI.
  async fn put_blob(&self, data: Bytes, content_type: &str) -> Result<String, TaskError>;

  /// Read back a blob previously stored under `uri`.
  async fn get_blob(&self, uri: &str) -> Result<Bytes, TaskError>;
}
