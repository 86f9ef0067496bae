use thiserror::Error;

/// Errors raised while resolving or validating a plugin.
#[derive(Debug, Error)]
pub enum PluginError {
  /// No plugin is registered under the requested type.
  #[error("unknown plugin type: {0}")]
  NotFound(String),

  /// The type identifier is not a dotted identifier.
  #[error("invalid plugin type name: '{0}'")]
  InvalidTypeName(String),

  /// A plugin with the same type was registered twice.
  #[error("plugin type already registered: {0}")]
  Duplicate(String),

  /// The plugin exists but does not provide the requested capability.
  #[error("plugin '{type_name}' is a {actual}, expected a {expected}")]
  CapabilityMismatch {
    type_name: String,
    expected: String,
    actual: String,
  },

  /// The type-specific configuration was rejected by the plugin.
  #[error("invalid configuration for '{type_name}': {message}")]
  InvalidConfig { type_name: String, message: String },
}

/// Errors raised by a task while running.
#[derive(Debug, Error)]
pub enum TaskError {
  /// The task's own logic failed.
  #[error("{message}")]
  Failed { message: String },

  /// A configuration property was missing or had the wrong shape.
  #[error("invalid property '{field}': {message}")]
  InvalidProperty { field: String, message: String },

  /// Template rendering failed.
  #[error("template error: {message}")]
  Template { message: String },

  /// The blob store rejected a read or write.
  #[error("blob store error: {message}")]
  Blob { message: String },

  /// The invocation ran past its deadline.
  #[error("task timed out after {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },

  /// The invocation observed a cancellation request.
  #[error("task cancelled")]
  Cancelled,
}

impl TaskError {
  /// Shorthand for a [`TaskError::Failed`].
  pub fn failed(message: impl Into<String>) -> Self {
    Self::Failed {
      message: message.into(),
    }
  }

  /// Shorthand for a [`TaskError::InvalidProperty`].
  pub fn property(field: impl Into<String>, message: impl Into<String>) -> Self {
    Self::InvalidProperty {
      field: field.into(),
      message: message.into(),
    }
  }
}

/// Errors raised while evaluating a trigger.
#[derive(Debug, Error)]
pub enum TriggerError {
  /// The evaluation itself failed (external I/O, bad response...).
  #[error("trigger evaluation failed: {message}")]
  Evaluation { message: String },

  /// The trigger configuration is unusable.
  #[error("invalid trigger configuration: {message}")]
  InvalidConfig { message: String },

  /// The evaluation ran past its deadline.
  #[error("trigger evaluation timed out after {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },
}
