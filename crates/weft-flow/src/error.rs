use thiserror::Error;
use weft_plugin::PluginError;

/// Errors raised while loading a flow. All of them abort activation.
#[derive(Debug, Error)]
pub enum FlowError {
  /// The document is not valid YAML/JSON or does not match the schema.
  #[error("failed to parse flow document: {message}")]
  Parse { message: String },

  /// The document parsed but breaks a structural rule.
  #[error("invalid flow '{flow}': {message}")]
  Validation { flow: String, message: String },

  #[error("duplicate id '{id}' in flow '{flow}'")]
  DuplicateId { flow: String, id: String },

  #[error("task '{task_id}' depends on unknown task '{dependency}'")]
  UnknownDependency { task_id: String, dependency: String },

  #[error("cycle detected in flow '{flow}' involving task '{task_id}'")]
  CycleDetected { flow: String, task_id: String },

  /// A type could not be resolved or rejected its configuration.
  #[error("plugin resolution failed for '{id}': {source}")]
  PluginResolution {
    id: String,
    #[source]
    source: PluginError,
  },

  #[error("invalid expression in '{id}': {message}")]
  Expression { id: String, message: String },

  #[error("io error reading '{path}': {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

/// Errors raised while rendering templates or evaluating expressions.
#[derive(Debug, Error)]
pub enum ExpressionError {
  #[error("failed to render '{template}': {message}")]
  Render { template: String, message: String },

  #[error("failed to evaluate '{expression}': {message}")]
  Evaluate { expression: String, message: String },

  #[error("expression '{expression}' must produce a list, got {actual}")]
  NotAList { expression: String, actual: String },
}
