use std::fmt;

use serde::{Deserialize, Serialize};

/// State of an execution.
///
/// ```text
/// CREATED -> RUNNING -> SUCCESS | WARNING | FAILED
///              |  ^
///              v  |
///            PAUSED
/// RUNNING | PAUSED -> KILLING -> KILLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
  Created,
  Running,
  Paused,
  Killing,
  Success,
  Warning,
  Failed,
  Killed,
}

impl ExecutionState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      ExecutionState::Success
        | ExecutionState::Warning
        | ExecutionState::Failed
        | ExecutionState::Killed
    )
  }

  /// Whether the state machine allows moving from `self` to `to`.
  pub fn can_transition_to(self, to: ExecutionState) -> bool {
    use ExecutionState::*;
    matches!(
      (self, to),
      (Created, Running | Killed | Failed)
        | (Running, Paused | Killing | Success | Warning | Failed)
        | (Paused, Running | Killing | Failed)
        | (Killing, Killed)
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ExecutionState::Created => "CREATED",
      ExecutionState::Running => "RUNNING",
      ExecutionState::Paused => "PAUSED",
      ExecutionState::Killing => "KILLING",
      ExecutionState::Success => "SUCCESS",
      ExecutionState::Warning => "WARNING",
      ExecutionState::Failed => "FAILED",
      ExecutionState::Killed => "KILLED",
    }
  }
}

impl fmt::Display for ExecutionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// State of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunState {
  Created,
  Running,
  Success,
  Warning,
  Failed,
  Killed,
  Skipped,
}

impl TaskRunState {
  pub fn is_terminal(self) -> bool {
    !matches!(self, TaskRunState::Created | TaskRunState::Running)
  }

  /// Terminal states that let downstream tasks run.
  pub fn is_successful(self) -> bool {
    matches!(self, TaskRunState::Success | TaskRunState::Warning)
  }

  /// Created may jump straight to a terminal state: an ended event can
  /// overtake its started event.
  pub fn can_transition_to(self, to: TaskRunState) -> bool {
    use TaskRunState::*;
    match self {
      Created => to != Created,
      Running => to.is_terminal(),
      _ => false,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskRunState::Created => "CREATED",
      TaskRunState::Running => "RUNNING",
      TaskRunState::Success => "SUCCESS",
      TaskRunState::Warning => "WARNING",
      TaskRunState::Failed => "FAILED",
      TaskRunState::Killed => "KILLED",
      TaskRunState::Skipped => "SKIPPED",
    }
  }
}

impl fmt::Display for TaskRunState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Reference to one revision of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRef {
  pub namespace: String,
  pub id: String,
  pub revision: u32,
}

impl FlowRef {
  pub fn new(namespace: impl Into<String>, id: impl Into<String>, revision: u32) -> Self {
    Self {
      namespace: namespace.into(),
      id: id.into(),
      revision,
    }
  }
}

impl fmt::Display for FlowRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}@{}", self.namespace, self.id, self.revision)
  }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
  Manual,
  Schedule,
  Event,
  Subflow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggeringContext {
  pub kind: TriggerKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub trigger_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fire_key: Option<String>,
  /// Exposed to templates as `trigger`.
  #[serde(default)]
  pub payload: serde_json::Value,
}

impl TriggeringContext {
  pub fn manual() -> Self {
    Self {
      kind: TriggerKind::Manual,
      trigger_id: None,
      fire_key: None,
      payload: serde_json::Value::Null,
    }
  }
}

/// The task run a child execution reports back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
  pub execution_id: String,
  pub task_id: String,
  pub iteration: u32,
  pub attempt: u32,
}

/// Category of a task run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// Raised by the plugin's own logic.
  Task,
  Timeout,
  /// The worker stopped heartbeating.
  Orphaned,
  /// A message could not be delivered within its redelivery budget.
  Delivery,
  Cancelled,
  /// The plugin or its configuration could not be resolved at run time.
  Resolution,
  /// The child execution did not succeed.
  Subflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunError {
  pub kind: ErrorKind,
  pub message: String,
}

impl TaskRunError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }
}

impl fmt::Display for TaskRunError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}: {}", self.kind, self.message)
  }
}

/// Why a task run was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
  /// The task's condition evaluated to false. Downstream tasks still run.
  ConditionFalse,
  /// A predecessor did not succeed.
  UpstreamFailed,
  /// `forEach` produced no items. Downstream tasks still run.
  EmptyIteration,
}

impl SkipReason {
  /// Whether a task skipped for this reason lets its successors run.
  pub fn passes_through(self) -> bool {
    matches!(self, SkipReason::ConditionFalse | SkipReason::EmptyIteration)
  }
}

/// Which part of the flow a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
  Main,
  Errors,
  Listeners,
}
