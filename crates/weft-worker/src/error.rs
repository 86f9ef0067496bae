use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
  #[error("queue error: {0}")]
  Queue(#[from] weft_queue::QueueError),

  #[error("lease store error: {0}")]
  Store(#[from] weft_store::Error),
}
