use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::info::Plugin;

/// Values produced by a successful task run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
  /// Output values, exposed to downstream tasks as `outputs.<taskId>`.
  pub values: serde_json::Map<String, serde_json::Value>,
  /// Non-fatal problems; a non-empty list ends the run in WARNING.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub warnings: Vec<String>,
}

impl Output {
  pub fn new(values: serde_json::Map<String, serde_json::Value>) -> Self {
    Self {
      values,
      warnings: Vec::new(),
    }
  }

  /// An output with no values.
  pub fn empty() -> Self {
    Self::default()
  }

  /// Build an output from a JSON value. Objects become the value map, anything
  /// else is stored under `value`.
  pub fn from_value(value: serde_json::Value) -> Self {
    match value {
      serde_json::Value::Object(values) => Self::new(values),
      serde_json::Value::Null => Self::empty(),
      other => {
        let mut values = serde_json::Map::new();
        values.insert("value".to_string(), other);
        Self::new(values)
      }
    }
  }

  pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
    self.warnings.push(warning.into());
    self
  }
}

/// A task that runs inline on a worker.
#[async_trait]
pub trait Task: Plugin {
  /// Run the task. `config` is the type-specific configuration from the flow
  /// document; string properties are still templates and are rendered through
  /// the context when the task needs them.
  async fn run(
    &self,
    ctx: &dyn TaskContext,
    config: &serde_json::Value,
  ) -> Result<Output, TaskError>;
}

/// Reference to the flow a [`Flowable`] task delegates to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubflowSpec {
  pub namespace: String,
  pub flow_id: String,
  /// Pinned revision, or the latest one when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub revision: Option<u32>,
  #[serde(default)]
  pub inputs: serde_json::Value,
}

/// A task whose work is a child execution.
///
/// The worker never runs a flowable inline: it asks the plugin which flow to
/// start and hands that to the executor. The task completes when the child
/// execution reaches a terminal state.
#[async_trait]
pub trait Flowable: Plugin {
  async fn subflow(
    &self,
    ctx: &dyn TaskContext,
    config: &serde_json::Value,
  ) -> Result<SubflowSpec, TaskError>;
}
