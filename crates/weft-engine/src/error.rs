use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("flow error: {0}")]
  Flow(#[from] weft_flow::FlowError),

  #[error("store error: {0}")]
  Store(#[from] weft_store::Error),

  #[error("queue error: {0}")]
  Queue(#[from] weft_queue::QueueError),

  #[error("plugin error: {0}")]
  Plugin(#[from] weft_plugin::PluginError),

  #[error("executor error: {0}")]
  Executor(#[from] weft_executor::ExecutorError),

  #[error("worker error: {0}")]
  Worker(#[from] weft_worker::WorkerError),

  #[error("flow '{namespace}.{flow_id}' is not deployed")]
  FlowNotFound { namespace: String, flow_id: String },

  #[error("execution '{0}' not found")]
  ExecutionNotFound(String),

  #[error("execution '{0}' did not finish in time")]
  Timeout(String),

  #[error("role task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}
