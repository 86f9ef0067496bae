use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Branch, ErrorKind, SkipReason, TaskRunError, TaskRunState};

/// One attempt of a task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
  pub attempt: u32,
  pub state: TaskRunState,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub worker_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ended_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<TaskRunError>,
}

/// Record of one task (or one `forEach` iteration of it) inside an execution.
///
/// The current attempt lives in the top-level fields; finished attempts are
/// kept in [`TaskRun::attempts`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
  pub id: String,
  pub task_id: String,
  pub iteration: u32,
  /// The `forEach` item bound to this iteration.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<serde_json::Value>,
  pub branch: Branch,
  pub attempt: u32,
  pub state: TaskRunState,
  #[serde(default)]
  pub attempts: Vec<Attempt>,
  /// Configuration the current attempt was started with.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resolved_config: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub outputs: Option<serde_json::Map<String, serde_json::Value>>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub warnings: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<TaskRunError>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub skip_reason: Option<SkipReason>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub worker_id: Option<String>,
  /// When the current attempt was requested.
  pub requested_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_heartbeat_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ended_at: Option<DateTime<Utc>>,
  /// Set while a retry is waiting for its backoff to elapse.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subflow_execution_id: Option<String>,
  #[serde(default)]
  pub cancel_requested: bool,
  /// The start of the current attempt is withheld until the execution
  /// resumes.
  #[serde(default)]
  pub start_held: bool,
}

impl TaskRun {
  pub fn new(
    execution_id: &str,
    task_id: impl Into<String>,
    iteration: u32,
    branch: Branch,
    now: DateTime<Utc>,
  ) -> Self {
    let task_id = task_id.into();
    Self {
      id: format!("{execution_id}/{task_id}/{iteration}"),
      task_id,
      iteration,
      value: None,
      branch,
      attempt: 1,
      state: TaskRunState::Created,
      attempts: Vec::new(),
      resolved_config: None,
      outputs: None,
      warnings: Vec::new(),
      error: None,
      skip_reason: None,
      worker_id: None,
      requested_at: now,
      started_at: None,
      last_heartbeat_at: None,
      ended_at: None,
      retry_at: None,
      subflow_execution_id: None,
      cancel_requested: false,
      start_held: false,
    }
  }

  /// A run that is skipped without ever being requested.
  pub fn skipped(
    execution_id: &str,
    task_id: impl Into<String>,
    iteration: u32,
    branch: Branch,
    reason: SkipReason,
    now: DateTime<Utc>,
  ) -> Self {
    let mut run = Self::new(execution_id, task_id, iteration, branch, now);
    run.state = TaskRunState::Skipped;
    run.skip_reason = Some(reason);
    run.ended_at = Some(now);
    run
  }

  pub fn is_terminal(&self) -> bool {
    self.state.is_terminal()
  }

  /// Record a worker picking up the current attempt.
  pub fn mark_running(&mut self, worker_id: &str, now: DateTime<Utc>) -> bool {
    if !self.state.can_transition_to(TaskRunState::Running) {
      return false;
    }
    self.state = TaskRunState::Running;
    self.worker_id = Some(worker_id.to_string());
    self.started_at = Some(now);
    self.last_heartbeat_at = Some(now);
    true
  }

  /// Move the current attempt to a terminal state.
  pub fn finish(
    &mut self,
    state: TaskRunState,
    outputs: Option<serde_json::Map<String, serde_json::Value>>,
    error: Option<TaskRunError>,
    now: DateTime<Utc>,
  ) -> bool {
    if !state.is_terminal() || !self.state.can_transition_to(state) {
      return false;
    }
    self.state = state;
    self.outputs = outputs;
    self.error = error;
    self.ended_at = Some(now);
    self.retry_at = None;
    self.start_held = false;
    self.archive_attempt();
    true
  }

  /// Archive the failed attempt and reset the run for `attempt + 1`.
  pub fn schedule_retry(&mut self, error: TaskRunError, retry_at: DateTime<Utc>, now: DateTime<Utc>) {
    self.state = TaskRunState::Failed;
    self.error = Some(error);
    self.ended_at = Some(now);
    self.archive_attempt();

    self.attempt += 1;
    self.state = TaskRunState::Created;
    self.error = None;
    self.outputs = None;
    self.warnings.clear();
    self.worker_id = None;
    self.started_at = None;
    self.last_heartbeat_at = None;
    self.ended_at = None;
    self.requested_at = now;
    self.retry_at = Some(retry_at);
  }

  fn archive_attempt(&mut self) {
    self.attempts.push(Attempt {
      attempt: self.attempt,
      state: self.state,
      worker_id: self.worker_id.clone(),
      started_at: self.started_at,
      ended_at: self.ended_at,
      error: self.error.clone(),
    });
  }

  /// Whether the current attempt failed because of a timeout.
  pub fn timed_out(&self) -> bool {
    self
      .error
      .as_ref()
      .is_some_and(|e| e.kind == ErrorKind::Timeout)
  }
}
