use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
  #[error("store error: {0}")]
  Store(#[from] weft_store::Error),

  #[error("queue error: {0}")]
  Queue(#[from] weft_queue::QueueError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("execution not found: {0}")]
  ExecutionNotFound(String),

  #[error("flow not found: {0}")]
  FlowNotFound(String),

  #[error("task '{task_id}' is not part of flow {flow}")]
  UnknownTask { flow: String, task_id: String },

  /// Another executor instance holds the execution.
  #[error("execution '{0}' is owned by another executor")]
  Busy(String),
}
