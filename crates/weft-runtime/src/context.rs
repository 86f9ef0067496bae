use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::Span;
use weft_artifact::{BlobStore, is_blob_uri};
use weft_flow::Expressions;
use weft_plugin::{LogLevel, TaskContext, TaskError};

use crate::runtime::RunScope;

const MASK: &str = "******";

/// One line logged by a plugin.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
  pub at: DateTime<Utc>,
  #[serde(serialize_with = "serialize_level")]
  pub level: LogLevel,
  pub message: String,
}

fn serialize_level<S: serde::Serializer>(level: &LogLevel, s: S) -> Result<S::Ok, S::Error> {
  let name = match level {
    LogLevel::Trace => "trace",
    LogLevel::Debug => "debug",
    LogLevel::Info => "info",
    LogLevel::Warn => "warn",
    LogLevel::Error => "error",
  };
  s.serialize_str(name)
}

/// What a closed context leaves behind.
#[derive(Debug, Default)]
pub struct RunSummary {
  pub logs: Vec<LogLine>,
}

/// The [`TaskContext`] handed to a plugin for a single attempt.
pub struct RunContext {
  scope: RunScope,
  expressions: Expressions,
  blobs: BlobStore,
  cancel: CancellationToken,
  revealed: Arc<Mutex<Vec<String>>>,
  logs: Mutex<Vec<LogLine>>,
  max_inline_output_bytes: usize,
  span: Span,
}

impl RunContext {
  pub(crate) fn new(
    scope: RunScope,
    expressions: Expressions,
    blobs: BlobStore,
    cancel: CancellationToken,
    revealed: Arc<Mutex<Vec<String>>>,
    max_inline_output_bytes: usize,
  ) -> Self {
    let span = tracing::info_span!(
      "task_run",
      execution_id = %scope.execution_id,
      task_id = %scope.task_id,
      task_type = %scope.task_type,
      iteration = scope.iteration,
      attempt = scope.attempt,
    );
    Self {
      scope,
      expressions,
      blobs,
      cancel,
      revealed,
      logs: Mutex::new(Vec::new()),
      max_inline_output_bytes,
      span,
    }
  }

  pub fn scope(&self) -> &RunScope {
    &self.scope
  }

  pub fn span(&self) -> &Span {
    &self.span
  }

  /// Replace secret values revealed so far with a mask.
  pub fn redact(&self, text: &str) -> String {
    let revealed = self.revealed.lock().unwrap_or_else(|e| e.into_inner());
    revealed
      .iter()
      .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), MASK))
  }

  /// Move oversized string values into the blob store, leaving their URIs.
  pub async fn offload(&self, mut outputs: Map<String, Value>) -> Result<Map<String, Value>, TaskError> {
    let limit = self.max_inline_output_bytes;
    let mut large = Vec::new();
    for value in outputs.values_mut() {
      collect_large(value, limit, &mut large);
    }

    for value in large {
      let Value::String(text) = value else {
        continue;
      };
      let data = Bytes::from(std::mem::take(text));
      let size = data.len();
      let uri = self.put_blob(data, "text/plain").await?;
      tracing::debug!(parent: &self.span, size, uri = %uri, "output offloaded");
      *value = Value::String(uri);
    }

    Ok(outputs)
  }

  /// Tear the context down, flushing buffered logs.
  pub fn close(self) -> RunSummary {
    let span = self.span.clone();
    let logs = self
      .logs
      .into_inner()
      .unwrap_or_else(|e| e.into_inner());
    tracing::debug!(parent: &span, lines = logs.len(), "run context closed");
    RunSummary { logs }
  }
}

fn collect_large<'a>(value: &'a mut Value, limit: usize, out: &mut Vec<&'a mut Value>) {
  if matches!(value, Value::String(s) if s.len() > limit && !is_blob_uri(s)) {
    out.push(value);
    return;
  }
  match value {
    Value::Array(items) => {
      for item in items {
        collect_large(item, limit, out);
      }
    }
    Value::Object(map) => {
      for item in map.values_mut() {
        collect_large(item, limit, out);
      }
    }
    _ => {}
  }
}

#[async_trait]
impl TaskContext for RunContext {
  fn execution_id(&self) -> &str {
    &self.scope.execution_id
  }

  fn task_id(&self) -> &str {
    &self.scope.task_id
  }

  fn iteration(&self) -> u32 {
    self.scope.iteration
  }

  fn attempt(&self) -> u32 {
    self.scope.attempt
  }

  fn variables(&self) -> &Value {
    &self.scope.variables
  }

  fn render(&self, template: &str) -> Result<String, TaskError> {
    self
      .expressions
      .render_str(template, &self.scope.variables)
      .map_err(|e| TaskError::Template {
        message: self.redact(&e.to_string()),
      })
  }

  fn render_value(&self, value: &Value) -> Result<Value, TaskError> {
    self
      .expressions
      .render_value(value, &self.scope.variables)
      .map_err(|e| TaskError::Template {
        message: self.redact(&e.to_string()),
      })
  }

  fn log(&self, level: LogLevel, message: &str) {
    let message = self.redact(message);
    let execution_id = &self.scope.execution_id;
    let task_id = &self.scope.task_id;
    match level {
      LogLevel::Trace => {
        tracing::trace!(parent: &self.span, execution_id = %execution_id, task_id = %task_id, "{}", message)
      }
      LogLevel::Debug => {
        tracing::debug!(parent: &self.span, execution_id = %execution_id, task_id = %task_id, "{}", message)
      }
      LogLevel::Info => {
        tracing::info!(parent: &self.span, execution_id = %execution_id, task_id = %task_id, "{}", message)
      }
      LogLevel::Warn => {
        tracing::warn!(parent: &self.span, execution_id = %execution_id, task_id = %task_id, "{}", message)
      }
      LogLevel::Error => {
        tracing::error!(parent: &self.span, execution_id = %execution_id, task_id = %task_id, "{}", message)
      }
    }

    let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
    logs.push(LogLine {
      at: Utc::now(),
      level,
      message,
    });
  }

  fn cancellation(&self) -> CancellationToken {
    self.cancel.clone()
  }

  async fn put_blob(&self, data: Bytes, content_type: &str) -> Result<String, TaskError> {
    self
      .blobs
      .put(data, content_type)
      .await
      .map_err(|e| TaskError::Blob {
        message: e.to_string(),
      })
  }

  async fn get_blob(&self, uri: &str) -> Result<Bytes, TaskError> {
    self.blobs.get(uri).await.map_err(|e| TaskError::Blob {
      message: e.to_string(),
    })
  }
}
