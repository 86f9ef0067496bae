use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Identity and versioning shared by every plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
  /// Fully-qualified type, e.g. `io.weft.core.log.Log`.
  pub type_name: String,
  /// Plugin version, free-form (usually semver).
  pub version: String,
  /// Short human readable title.
  pub title: String,
}

impl PluginInfo {
  pub fn new(
    type_name: impl Into<String>,
    version: impl Into<String>,
    title: impl Into<String>,
  ) -> Self {
    Self {
      type_name: type_name.into(),
      version: version.into(),
      title: title.into(),
    }
  }
}

/// Behaviour common to all capabilities.
pub trait Plugin: Send + Sync {
  /// Identity of this plugin.
  fn info(&self) -> &PluginInfo;

  /// Validate the type-specific configuration at flow load time.
  ///
  /// The default accepts anything.
  fn validate(&self, _config: &serde_json::Value) -> Result<(), PluginError> {
    Ok(())
  }
}

/// Check that `name` is a dotted identifier: at least two segments, each
/// starting with a letter or underscore and continuing with alphanumerics or
/// underscores.
pub fn is_valid_type_name(name: &str) -> bool {
  let mut segments = 0;
  for segment in name.split('.') {
    let mut chars = segment.chars();
    match chars.next() {
      Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
      _ => return false,
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
      return false;
    }
    segments += 1;
  }
  segments >= 2
}
