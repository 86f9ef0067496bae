use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use weft_artifact::{BlobStore, MemoryStore};
use weft_runtime::{MapSecretProvider, RunContext, RunScope, Runtime};

pub fn context(variables: serde_json::Value) -> RunContext {
  let runtime = Runtime::new(
    BlobStore::new(Arc::new(MemoryStore::new())),
    Arc::new(MapSecretProvider::new()),
  );
  runtime.context(
    RunScope {
      execution_id: "exec-1".to_string(),
      task_id: "task".to_string(),
      task_type: "io.weft.core.test".to_string(),
      iteration: 0,
      attempt: 1,
      variables,
    },
    CancellationToken::new(),
  )
}
