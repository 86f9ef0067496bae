use weft_plugin::{PluginError, TaskContext, TaskError};

/// Fetch `field` from `config` and render it as a string template.
pub fn render_str(
  ctx: &dyn TaskContext,
  config: &serde_json::Value,
  field: &str,
) -> Result<Option<String>, TaskError> {
  match config.get(field) {
    None | Some(serde_json::Value::Null) => Ok(None),
    Some(serde_json::Value::String(template)) => ctx.render(template).map(Some),
    Some(other) => Ok(Some(other.to_string())),
  }
}

/// Like [`render_str`] but the property must be present.
pub fn require_str(
  ctx: &dyn TaskContext,
  config: &serde_json::Value,
  field: &str,
) -> Result<String, TaskError> {
  render_str(ctx, config, field)?.ok_or_else(|| TaskError::property(field, "is required"))
}

/// Load-time check that `field` is present.
pub fn validate_present(
  type_name: &str,
  config: &serde_json::Value,
  field: &str,
) -> Result<(), PluginError> {
  match config.get(field) {
    Some(value) if !value.is_null() => Ok(()),
    _ => Err(PluginError::InvalidConfig {
      type_name: type_name.to_string(),
      message: format!("'{field}' is required"),
    }),
  }
}

/// Read a duration given in milliseconds, either as a number or as a
/// template rendering to one.
pub fn render_millis(
  ctx: &dyn TaskContext,
  config: &serde_json::Value,
  field: &str,
) -> Result<Option<u64>, TaskError> {
  match config.get(field) {
    None | Some(serde_json::Value::Null) => Ok(None),
    Some(serde_json::Value::Number(n)) => n
      .as_u64()
      .map(Some)
      .ok_or_else(|| TaskError::property(field, "must be a non-negative integer")),
    Some(serde_json::Value::String(template)) => ctx
      .render(template)?
      .trim()
      .parse()
      .map(Some)
      .map_err(|_| TaskError::property(field, "must be a non-negative integer")),
    Some(_) => Err(TaskError::property(field, "must be a non-negative integer")),
  }
}
