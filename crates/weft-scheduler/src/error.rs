use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
  #[error("store error: {0}")]
  Store(#[from] weft_store::Error),

  #[error("queue error: {0}")]
  Queue(#[from] weft_queue::QueueError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("trigger '{trigger}' has an invalid schedule: {message}")]
  Schedule { trigger: String, message: String },

  #[error("trigger '{trigger}' evaluation failed: {source}")]
  Evaluation {
    trigger: String,
    #[source]
    source: weft_plugin::TriggerError,
  },
}
