use async_trait::async_trait;
use weft_plugin::{Output, Plugin, PluginError, PluginInfo, Task, TaskContext, TaskError};

use crate::properties::{require_str, validate_present};

const RETURN_TYPE: &str = "io.weft.core.debug.Return";
const OUTPUT_VALUES_TYPE: &str = "io.weft.core.output.OutputValues";

/// Render `format` and expose it as the `value` output.
pub struct Return {
  info: PluginInfo,
}

impl Return {
  pub fn new() -> Self {
    Self {
      info: PluginInfo::new(RETURN_TYPE, env!("CARGO_PKG_VERSION"), "Return"),
    }
  }
}

impl Default for Return {
  fn default() -> Self {
    Self::new()
  }
}

impl Plugin for Return {
  fn info(&self) -> &PluginInfo {
    &self.info
  }

  fn validate(&self, config: &serde_json::Value) -> Result<(), PluginError> {
    validate_present(RETURN_TYPE, config, "format")
  }
}

#[async_trait]
impl Task for Return {
  async fn run(
    &self,
    ctx: &dyn TaskContext,
    config: &serde_json::Value,
  ) -> Result<Output, TaskError> {
    let value = require_str(ctx, config, "format")?;
    Ok(Output::from_value(serde_json::Value::String(value)))
  }
}

/// Render every entry of `values` and expose them as outputs.
pub struct OutputValues {
  info: PluginInfo,
}

impl OutputValues {
  pub fn new() -> Self {
    Self {
      info: PluginInfo::new(OUTPUT_VALUES_TYPE, env!("CARGO_PKG_VERSION"), "Output values"),
    }
  }
}

impl Default for OutputValues {
  fn default() -> Self {
    Self::new()
  }
}

impl Plugin for OutputValues {
  fn info(&self) -> &PluginInfo {
    &self.info
  }

  fn validate(&self, config: &serde_json::Value) -> Result<(), PluginError> {
    match config.get("values") {
      Some(serde_json::Value::Object(_)) => Ok(()),
      _ => Err(PluginError::InvalidConfig {
        type_name: OUTPUT_VALUES_TYPE.to_string(),
        message: "'values' must be a map".to_string(),
      }),
    }
  }
}

#[async_trait]
impl Task for OutputValues {
  async fn run(
    &self,
    ctx: &dyn TaskContext,
    config: &serde_json::Value,
  ) -> Result<Output, TaskError> {
    let values = config
      .get("values")
      .ok_or_else(|| TaskError::property("values", "is required"))?;
    match ctx.render_value(values)? {
      serde_json::Value::Object(values) => Ok(Output::new(values)),
      _ => Err(TaskError::property("values", "must be a map")),
    }
  }
}
