use std::sync::Arc;

use async_trait::async_trait;
use weft_flow::{Flow, FlowLoader};
use weft_plugin::{
  Capability, Flowable, Output, Plugin, PluginInfo, PluginRegistry, SubflowSpec, Task,
  TaskContext, TaskError,
};

pub struct Noop {
  info: PluginInfo,
}

impl Plugin for Noop {
  fn info(&self) -> &PluginInfo {
    &self.info
  }
}

#[async_trait]
impl Task for Noop {
  async fn run(
    &self,
    _ctx: &dyn TaskContext,
    _config: &serde_json::Value,
  ) -> Result<Output, TaskError> {
    Ok(Output::empty())
  }
}

pub struct Subflow {
  info: PluginInfo,
}

impl Plugin for Subflow {
  fn info(&self) -> &PluginInfo {
    &self.info
  }
}

#[async_trait]
impl Flowable for Subflow {
  async fn subflow(
    &self,
    _ctx: &dyn TaskContext,
    config: &serde_json::Value,
  ) -> Result<SubflowSpec, TaskError> {
    serde_json::from_value(config.clone()).map_err(|e| TaskError::property("flowId", e.to_string()))
  }
}

pub fn registry() -> Arc<PluginRegistry> {
  let mut registry = PluginRegistry::new();
  registry
    .register_instance(Capability::Task(Arc::new(Noop {
      info: PluginInfo::new("test.Noop", "1.0.0", "Noop"),
    })))
    .unwrap();
  registry
    .register_instance(Capability::Flowable(Arc::new(Subflow {
      info: PluginInfo::new("test.Subflow", "1.0.0", "Subflow"),
    })))
    .unwrap();
  Arc::new(registry)
}

pub fn load(yaml: &str) -> Flow {
  FlowLoader::new(registry()).load_str(yaml).unwrap()
}
