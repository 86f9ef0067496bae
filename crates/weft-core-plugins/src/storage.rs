use async_trait::async_trait;
use bytes::Bytes;
use weft_plugin::{Output, Plugin, PluginError, PluginInfo, Task, TaskContext, TaskError};

use crate::properties::{render_str, require_str, validate_present};

const TYPE: &str = "io.weft.core.storage.Write";

/// Write rendered `content` to the blob store and output its `uri`.
pub struct Write {
  info: PluginInfo,
}

impl Write {
  pub fn new() -> Self {
    Self {
      info: PluginInfo::new(TYPE, env!("CARGO_PKG_VERSION"), "Write"),
    }
  }
}

impl Default for Write {
  fn default() -> Self {
    Self::new()
  }
}

impl Plugin for Write {
  fn info(&self) -> &PluginInfo {
    &self.info
  }

  fn validate(&self, config: &serde_json::Value) -> Result<(), PluginError> {
    validate_present(TYPE, config, "content")
  }
}

#[async_trait]
impl Task for Write {
  async fn run(
    &self,
    ctx: &dyn TaskContext,
    config: &serde_json::Value,
  ) -> Result<Output, TaskError> {
    let content = require_str(ctx, config, "content")?;
    let content_type =
      render_str(ctx, config, "contentType")?.unwrap_or_else(|| "text/plain".to_string());
    let size = content.len();
    let uri = ctx.put_blob(Bytes::from(content), &content_type).await?;

    let mut values = serde_json::Map::new();
    values.insert("uri".to_string(), serde_json::Value::String(uri));
    values.insert("size".to_string(), serde_json::Value::from(size));
    Ok(Output::new(values))
  }
}
