use async_trait::async_trait;
use weft_plugin::{Output, Plugin, PluginInfo, Task, TaskContext, TaskError};

use crate::properties::render_str;

const TYPE: &str = "io.weft.core.execution.Fail";

/// Fail the task run, optionally only when `when` renders truthy.
///
/// The task-level `condition` skips the run instead of passing it.
pub struct Fail {
  info: PluginInfo,
}

impl Fail {
  pub fn new() -> Self {
    Self {
      info: PluginInfo::new(TYPE, env!("CARGO_PKG_VERSION"), "Fail"),
    }
  }
}

impl Default for Fail {
  fn default() -> Self {
    Self::new()
  }
}

impl Plugin for Fail {
  fn info(&self) -> &PluginInfo {
    &self.info
  }
}

fn truthy(rendered: &str) -> bool {
  !matches!(
    rendered.trim().to_ascii_lowercase().as_str(),
    "" | "false" | "0" | "none" | "null"
  )
}

#[async_trait]
impl Task for Fail {
  async fn run(
    &self,
    ctx: &dyn TaskContext,
    config: &serde_json::Value,
  ) -> Result<Output, TaskError> {
    if let Some(when) = render_str(ctx, config, "when")? {
      if !truthy(&when) {
        return Ok(Output::empty());
      }
    }
    let message = render_str(ctx, config, "errorMessage")?
      .unwrap_or_else(|| "task failed on purpose".to_string());
    Err(TaskError::failed(message))
  }
}
