use std::time::Duration;

use tracing::{instrument, warn};
use weft_plugin::{Trigger, TriggerError, TriggerRequest, TriggerSeed};

/// Runs a single trigger evaluation with a deadline.
#[derive(Debug, Clone)]
pub struct TriggerRunner {
  timeout: Duration,
}

impl TriggerRunner {
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }

  #[instrument(
    name = "trigger_evaluate",
    skip(self, plugin, request, config),
    fields(
      namespace = %request.namespace,
      flow_id = %request.flow_id,
      trigger_id = %request.trigger_id,
    )
  )]
  pub async fn evaluate(
    &self,
    plugin: &dyn Trigger,
    request: &TriggerRequest,
    config: &serde_json::Value,
  ) -> Result<Option<TriggerSeed>, TriggerError> {
    match tokio::time::timeout(self.timeout, plugin.evaluate(request, config)).await {
      Ok(result) => result,
      Err(_) => {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        warn!(timeout_ms, "trigger evaluation timed out");
        Err(TriggerError::Timeout { timeout_ms })
      }
    }
  }
}

impl Default for TriggerRunner {
  fn default() -> Self {
    Self::new(Duration::from_secs(30))
  }
}
