use std::time::Duration;

use async_trait::async_trait;
use weft_plugin::{Output, Plugin, PluginError, PluginInfo, Task, TaskContext, TaskError};

use crate::properties::{render_millis, validate_present};

const TYPE: &str = "io.weft.core.flow.Sleep";

/// Wait for `duration` milliseconds, stopping early when the run is killed.
pub struct Sleep {
  info: PluginInfo,
}

impl Sleep {
  pub fn new() -> Self {
    Self {
      info: PluginInfo::new(TYPE, env!("CARGO_PKG_VERSION"), "Sleep"),
    }
  }
}

impl Default for Sleep {
  fn default() -> Self {
    Self::new()
  }
}

impl Plugin for Sleep {
  fn info(&self) -> &PluginInfo {
    &self.info
  }

  fn validate(&self, config: &serde_json::Value) -> Result<(), PluginError> {
    validate_present(TYPE, config, "duration")
  }
}

#[async_trait]
impl Task for Sleep {
  async fn run(
    &self,
    ctx: &dyn TaskContext,
    config: &serde_json::Value,
  ) -> Result<Output, TaskError> {
    let millis = render_millis(ctx, config, "duration")?
      .ok_or_else(|| TaskError::property("duration", "is required"))?;
    let cancel = ctx.cancellation();
    tokio::select! {
      _ = cancel.cancelled() => Err(TaskError::Cancelled),
      _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(Output::empty()),
    }
  }
}
