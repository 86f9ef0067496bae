use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use weft_artifact::BlobStore;
use weft_flow::Expressions;

use crate::context::RunContext;
use crate::secrets::SecretProvider;

/// Inline output strings larger than this are moved to the blob store.
pub const DEFAULT_MAX_INLINE_OUTPUT_BYTES: usize = 64 * 1024;

/// Identity and variable scope of one task-run attempt.
#[derive(Debug, Clone)]
pub struct RunScope {
  pub execution_id: String,
  pub task_id: String,
  pub task_type: String,
  pub iteration: u32,
  pub attempt: u32,
  pub variables: serde_json::Value,
}

/// Services shared by every run context a worker creates.
#[derive(Clone)]
pub struct Runtime {
  expressions: Expressions,
  secrets: Arc<dyn SecretProvider>,
  blobs: BlobStore,
  max_inline_output_bytes: usize,
}

impl Runtime {
  pub fn new(blobs: BlobStore, secrets: Arc<dyn SecretProvider>) -> Self {
    Self {
      expressions: Expressions::new(),
      secrets,
      blobs,
      max_inline_output_bytes: DEFAULT_MAX_INLINE_OUTPUT_BYTES,
    }
  }

  pub fn with_expressions(mut self, expressions: Expressions) -> Self {
    self.expressions = expressions;
    self
  }

  pub fn with_max_inline_output_bytes(mut self, bytes: usize) -> Self {
    self.max_inline_output_bytes = bytes;
    self
  }

  pub fn blobs(&self) -> &BlobStore {
    &self.blobs
  }

  /// Build the context for one attempt.
  ///
  /// Each context gets its own copy of the template environment with a
  /// `secret(name)` function bound to the provider; every value it reveals is
  /// remembered so log lines can be masked.
  pub fn context(&self, scope: RunScope, cancel: CancellationToken) -> RunContext {
    let revealed: Arc<Mutex<Vec<String>>> = Arc::default();
    let mut expressions = self.expressions.clone();

    let secrets = self.secrets.clone();
    let seen = revealed.clone();
    expressions.environment_mut().add_function(
      "secret",
      move |name: String| -> Result<String, minijinja::Error> {
        let value = secrets.get(&name).ok_or_else(|| {
          minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("secret '{name}' is not defined"),
          )
        })?;
        let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
        if !value.is_empty() && !seen.contains(&value) {
          seen.push(value.clone());
        }
        Ok(value)
      },
    );

    RunContext::new(
      scope,
      expressions,
      self.blobs.clone(),
      cancel,
      revealed,
      self.max_inline_output_bytes,
    )
  }
}
