use async_trait::async_trait;
use weft_plugin::{
  Flowable, Plugin, PluginError, PluginInfo, SubflowSpec, TaskContext, TaskError,
};

use crate::properties::{render_str, require_str, validate_present};

const TYPE: &str = "io.weft.core.flow.Subflow";

/// Start another flow as a child execution and complete with its outputs.
///
/// ```yaml
/// - id: child
///   type: io.weft.core.flow.Subflow
///   namespace: team
///   flowId: cleanup
///   inputs:
///     day: "{{ trigger.date }}"
/// ```
pub struct Subflow {
  info: PluginInfo,
}

impl Subflow {
  pub fn new() -> Self {
    Self {
      info: PluginInfo::new(TYPE, env!("CARGO_PKG_VERSION"), "Subflow"),
    }
  }
}

impl Default for Subflow {
  fn default() -> Self {
    Self::new()
  }
}

impl Plugin for Subflow {
  fn info(&self) -> &PluginInfo {
    &self.info
  }

  fn validate(&self, config: &serde_json::Value) -> Result<(), PluginError> {
    validate_present(TYPE, config, "namespace")?;
    validate_present(TYPE, config, "flowId")?;
    match config.get("inputs") {
      None | Some(serde_json::Value::Object(_)) => Ok(()),
      Some(_) => Err(PluginError::InvalidConfig {
        type_name: TYPE.to_string(),
        message: "'inputs' must be a map".to_string(),
      }),
    }
  }
}

#[async_trait]
impl Flowable for Subflow {
  async fn subflow(
    &self,
    ctx: &dyn TaskContext,
    config: &serde_json::Value,
  ) -> Result<SubflowSpec, TaskError> {
    let revision = match render_str(ctx, config, "revision")? {
      Some(revision) => Some(
        revision
          .trim()
          .parse()
          .map_err(|_| TaskError::property("revision", "must be a positive integer"))?,
      ),
      None => None,
    };
    let inputs = match config.get("inputs") {
      Some(inputs) => ctx.render_value(inputs)?,
      None => serde_json::Value::Object(serde_json::Map::new()),
    };

    Ok(SubflowSpec {
      namespace: require_str(ctx, config, "namespace")?,
      flow_id: require_str(ctx, config, "flowId")?,
      revision,
      inputs,
    })
  }
}
