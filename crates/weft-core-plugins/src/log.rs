use async_trait::async_trait;
use weft_plugin::{
  LogLevel, Output, Plugin, PluginError, PluginInfo, Task, TaskContext, TaskError,
};

use crate::properties::validate_present;

const TYPE: &str = "io.weft.core.log.Log";

/// Write one or more rendered messages to the task log.
///
/// ```yaml
/// - id: hello
///   type: io.weft.core.log.Log
///   level: INFO
///   message: "hello {{ inputs.name }}"
/// ```
pub struct Log {
  info: PluginInfo,
}

impl Log {
  pub fn new() -> Self {
    Self {
      info: PluginInfo::new(TYPE, env!("CARGO_PKG_VERSION"), "Log"),
    }
  }
}

impl Default for Log {
  fn default() -> Self {
    Self::new()
  }
}

fn parse_level(level: &str) -> Option<LogLevel> {
  match level.to_ascii_uppercase().as_str() {
    "TRACE" => Some(LogLevel::Trace),
    "DEBUG" => Some(LogLevel::Debug),
    "INFO" => Some(LogLevel::Info),
    "WARN" | "WARNING" => Some(LogLevel::Warn),
    "ERROR" => Some(LogLevel::Error),
    _ => None,
  }
}

impl Plugin for Log {
  fn info(&self) -> &PluginInfo {
    &self.info
  }

  fn validate(&self, config: &serde_json::Value) -> Result<(), PluginError> {
    validate_present(TYPE, config, "message")?;
    if let Some(level) = config.get("level").and_then(|l| l.as_str()) {
      if parse_level(level).is_none() {
        return Err(PluginError::InvalidConfig {
          type_name: TYPE.to_string(),
          message: format!("unknown level '{level}'"),
        });
      }
    }
    Ok(())
  }
}

#[async_trait]
impl Task for Log {
  async fn run(
    &self,
    ctx: &dyn TaskContext,
    config: &serde_json::Value,
  ) -> Result<Output, TaskError> {
    let level = config
      .get("level")
      .and_then(|l| l.as_str())
      .and_then(parse_level)
      .unwrap_or(LogLevel::Info);

    let messages = match config.get("message") {
      Some(serde_json::Value::Array(items)) => items.clone(),
      Some(message) => vec![message.clone()],
      None => return Err(TaskError::property("message", "is required")),
    };
    for message in &messages {
      let line = match message {
        serde_json::Value::String(template) => ctx.render(template)?,
        other => other.to_string(),
      };
      ctx.log(level, &line);
    }
    Ok(Output::empty())
  }
}
