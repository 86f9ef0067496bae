use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use weft_plugin::{
  Capability, Output, Plugin, PluginError, PluginInfo, PluginRegistry, Task, TaskContext,
  TaskError, Trigger, TriggerPolicy,
};

pub struct Noop {
  info: PluginInfo,
}

impl Plugin for Noop {
  fn info(&self) -> &PluginInfo {
    &self.info
  }

  fn validate(&self, config: &serde_json::Value) -> Result<(), PluginError> {
    if config.get("invalid").is_some() {
      return Err(PluginError::InvalidConfig {
        type_name: self.info.type_name.clone(),
        message: "'invalid' is not allowed".to_string(),
      });
    }
    Ok(())
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

pub struct Cron {
  info: PluginInfo,
}

impl Plugin for Cron {
  fn info(&self) -> &PluginInfo {
    &self.info
  }
}

#[async_trait]
impl Trigger for Cron {
  fn policy(&self, config: &serde_json::Value) -> Result<TriggerPolicy, PluginError> {
    match config.get("cron").and_then(|c| c.as_str()) {
      Some(cron) => Ok(TriggerPolicy::Schedule {
        cron: cron.to_string(),
      }),
      None => Ok(TriggerPolicy::Poll {
        interval: Duration::from_millis(config.get("interval").and_then(|i| i.as_u64()).unwrap_or(1000)),
      }),
    }
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
    .register_instance(Capability::Trigger(Arc::new(Cron {
      info: PluginInfo::new("test.Cron", "1.0.0", "Cron"),
    })))
    .unwrap();
  Arc::new(registry)
}
