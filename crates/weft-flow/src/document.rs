//! Serializable flow documents.
//!
//! A document is what users write; [`crate::FlowLoader`] turns it into a
//! validated [`crate::Flow`]. Documents may be YAML or JSON and use camelCase
//! keys. Keys a task or trigger does not recognise are handed to its plugin
//! as type-specific configuration.
//!
//! ```yaml
//! id: hello
//! namespace: demo
//! tasks:
//!   - id: fetch
//!     type: io.weft.core.output.Return
//!     format: "{{ inputs.name }}"
//!     retry:
//!       type: exponential
//!       interval: 1000
//!       maxAttempts: 3
//!   - id: greet
//!     type: io.weft.core.log.Log
//!     message: "Hello {{ outputs.fetch.value }}"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDocument {
  pub id: String,
  pub namespace: String,
  #[serde(default = "default_revision")]
  pub revision: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  /// Default execution inputs, overridden by the triggering context.
  #[serde(default)]
  pub inputs: serde_json::Map<String, serde_json::Value>,
  /// Constants exposed to templates as `vars`.
  #[serde(default)]
  pub variables: serde_json::Map<String, serde_json::Value>,
  pub tasks: Vec<TaskDef>,
  #[serde(default)]
  pub triggers: Vec<TriggerDef>,
  /// Tasks run when a main task fails.
  #[serde(default)]
  pub errors: Vec<TaskDef>,
  /// Tasks run after everything else, whatever the outcome.
  #[serde(default)]
  pub listeners: Vec<TaskDef>,
  /// Disabled flows load but are never scheduled.
  #[serde(default)]
  pub disabled: bool,
}

fn default_revision() -> u32 {
  1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDef {
  pub id: String,
  #[serde(rename = "type")]
  pub type_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry: Option<RetryPolicy>,
  #[serde(default)]
  pub allow_failure: bool,
  /// Timeout in milliseconds.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout: Option<u64>,
  /// Explicit predecessors. When absent the previous task in document order
  /// is the only predecessor.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub depends_on: Option<Vec<String>>,
  /// Expression evaluated before the task runs; false skips it.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub condition: Option<String>,
  /// Expression producing a list; the task runs once per item.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub for_each: Option<String>,
  #[serde(default)]
  pub disabled: bool,
  #[serde(flatten)]
  pub config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDef {
  pub id: String,
  #[serde(rename = "type")]
  pub type_name: String,
  /// Window in milliseconds in which a fire key may only fire once.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dedup_window: Option<u64>,
  #[serde(default)]
  pub disabled: bool,
  #[serde(flatten)]
  pub config: serde_json::Map<String, serde_json::Value>,
}

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
  #[default]
  Constant,
  Linear,
  Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
  #[serde(rename = "type", default)]
  pub backoff: RetryBackoff,
  /// Total attempts including the first one.
  pub max_attempts: u32,
  /// Base delay in milliseconds.
  #[serde(default)]
  pub interval: u64,
  /// Upper bound on the delay in milliseconds.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_interval: Option<u64>,
}

impl RetryPolicy {
  /// Whether another attempt is allowed after `attempt` failed.
  pub fn should_retry(&self, attempt: u32) -> bool {
    attempt < self.max_attempts
  }

  /// Delay before the attempt following failed attempt `attempt` (1-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let ms = match self.backoff {
      RetryBackoff::Constant => self.interval,
      RetryBackoff::Linear => self.interval.saturating_mul(u64::from(attempt)),
      RetryBackoff::Exponential => {
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        self.interval.saturating_mul(factor)
      }
    };
    let ms = match self.max_interval {
      Some(max) => ms.min(max),
      None => ms,
    };
    Duration::from_millis(ms)
  }
}

impl FlowDocument {
  pub fn from_yaml(text: &str) -> Result<Self, FlowError> {
    serde_yaml_ng::from_str(text).map_err(|e| FlowError::Parse {
      message: e.to_string(),
    })
  }

  pub fn from_json(text: &str) -> Result<Self, FlowError> {
    serde_json::from_str(text).map_err(|e| FlowError::Parse {
      message: e.to_string(),
    })
  }

  /// Parse either format, picking JSON when the text starts with `{`.
  pub fn parse(text: &str) -> Result<Self, FlowError> {
    if text.trim_start().starts_with('{') {
      Self::from_json(text)
    } else {
      Self::from_yaml(text)
    }
  }
}
