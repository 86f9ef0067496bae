use async_trait::async_trait;
use weft_plugin::{Plugin, PluginError, PluginInfo, Trigger, TriggerPolicy};

const TYPE: &str = "io.weft.core.trigger.Schedule";

/// Start the flow at every occurrence of a cron expression.
///
/// The scheduler owns the fire times; the execution sees the scheduled
/// instant as `trigger.date`.
pub struct Schedule {
  info: PluginInfo,
}

impl Schedule {
  pub fn new() -> Self {
    Self {
      info: PluginInfo::new(TYPE, env!("CARGO_PKG_VERSION"), "Schedule"),
    }
  }
}

impl Default for Schedule {
  fn default() -> Self {
    Self::new()
  }
}

fn cron(config: &serde_json::Value) -> Result<&str, PluginError> {
  config
    .get("cron")
    .and_then(|c| c.as_str())
    .filter(|c| !c.trim().is_empty())
    .ok_or_else(|| PluginError::InvalidConfig {
      type_name: TYPE.to_string(),
      message: "'cron' is required".to_string(),
    })
}

impl Plugin for Schedule {
  fn info(&self) -> &PluginInfo {
    &self.info
  }

  fn validate(&self, config: &serde_json::Value) -> Result<(), PluginError> {
    cron(config).map(|_| ())
  }
}

#[async_trait]
impl Trigger for Schedule {
  fn policy(&self, config: &serde_json::Value) -> Result<TriggerPolicy, PluginError> {
    Ok(TriggerPolicy::Schedule {
      cron: cron(config)?.to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_policy_from_cron() {
    let policy = Schedule::new()
      .policy(&json!({ "cron": "*/5 * * * *" }))
      .unwrap();
    assert_eq!(
      policy,
      TriggerPolicy::Schedule {
        cron: "*/5 * * * *".to_string()
      }
    );
    assert!(Schedule::new().validate(&json!({})).is_err());
  }
}
