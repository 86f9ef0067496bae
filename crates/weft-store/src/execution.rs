use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::task_run::TaskRun;
use crate::types::{
  Branch, ExecutionState, FlowRef, ParentRef, SkipReason, TaskRunError, TaskRunState,
  TriggeringContext,
};

/// A state change recorded on the execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
  pub state: ExecutionState,
  pub at: DateTime<Utc>,
}

/// A message produced while handling an event, persisted with the execution
/// and published after the save succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
  pub topic: String,
  pub message: serde_json::Value,
  #[serde(default)]
  pub delay_ms: u64,
}

/// One run of a flow.
///
/// Only the executor mutates an execution. Every save bumps
/// [`Execution::version`]; repositories reject saves made from a stale copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
  pub id: String,
  pub flow: FlowRef,
  pub state: ExecutionState,
  #[serde(default)]
  pub version: u64,
  #[serde(default)]
  pub task_runs: Vec<TaskRun>,
  pub trigger: TriggeringContext,
  #[serde(default)]
  pub inputs: serde_json::Map<String, serde_json::Value>,
  #[serde(default)]
  pub outputs: serde_json::Map<String, serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent: Option<ParentRef>,
  /// Operator-visible diagnostic for failures not tied to a task run.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<TaskRunError>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ended_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub kill_requested_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub history: Vec<StateChange>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub outbox: Vec<OutboxEntry>,
}

impl Execution {
  pub fn new(
    id: impl Into<String>,
    flow: FlowRef,
    trigger: TriggeringContext,
    inputs: serde_json::Map<String, serde_json::Value>,
    parent: Option<ParentRef>,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      id: id.into(),
      flow,
      state: ExecutionState::Created,
      version: 0,
      task_runs: Vec::new(),
      trigger,
      inputs,
      outputs: serde_json::Map::new(),
      parent,
      error: None,
      created_at: now,
      updated_at: now,
      ended_at: None,
      kill_requested_at: None,
      history: vec![StateChange {
        state: ExecutionState::Created,
        at: now,
      }],
      outbox: Vec::new(),
    }
  }

  pub fn is_terminal(&self) -> bool {
    self.state.is_terminal()
  }

  /// Move to `to`, rejecting transitions the state machine does not allow.
  pub fn transition(&mut self, to: ExecutionState, now: DateTime<Utc>) -> Result<(), Error> {
    if !self.state.can_transition_to(to) {
      return Err(Error::InvalidTransition {
        execution_id: self.id.clone(),
        from: self.state,
        to,
      });
    }
    self.state = to;
    self.updated_at = now;
    if to.is_terminal() {
      self.ended_at = Some(now);
    }
    self.history.push(StateChange { state: to, at: now });
    Ok(())
  }

  pub fn runs_for<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a TaskRun> + 'a {
    self.task_runs.iter().filter(move |r| r.task_id == task_id)
  }

  pub fn run(&self, task_id: &str, iteration: u32) -> Option<&TaskRun> {
    self
      .task_runs
      .iter()
      .find(|r| r.task_id == task_id && r.iteration == iteration)
  }

  pub fn run_mut(&mut self, task_id: &str, iteration: u32) -> Option<&mut TaskRun> {
    self
      .task_runs
      .iter_mut()
      .find(|r| r.task_id == task_id && r.iteration == iteration)
  }

  pub fn has_runs(&self, task_id: &str) -> bool {
    self.task_runs.iter().any(|r| r.task_id == task_id)
  }

  /// Aggregate state of a task across its iterations, or `None` when the
  /// task has no runs yet.
  ///
  /// Non-terminal iterations win; otherwise FAILED > KILLED > WARNING >
  /// SUCCESS, and a task whose iterations were all skipped is SKIPPED.
  pub fn task_state(&self, task_id: &str) -> Option<TaskRunState> {
    let mut runs = self.runs_for(task_id).peekable();
    runs.peek()?;

    let mut folded = TaskRunState::Skipped;
    for run in runs {
      if !run.is_terminal() {
        return Some(run.state);
      }
      folded = worse(folded, run.state);
    }
    Some(folded)
  }

  /// The skip reason of a fully skipped task.
  pub fn skip_reason(&self, task_id: &str) -> Option<SkipReason> {
    let mut runs = self.runs_for(task_id);
    let first = runs.next()?.skip_reason?;
    runs.all(|r| r.state == TaskRunState::Skipped).then_some(first)
  }

  /// Outputs of a task: a map for single runs, a list ordered by iteration
  /// for `forEach` tasks.
  pub fn task_outputs(&self, task_id: &str) -> Option<serde_json::Value> {
    let mut runs: Vec<&TaskRun> = self.runs_for(task_id).collect();
    if runs.is_empty() {
      return None;
    }
    if runs.len() == 1 && runs[0].value.is_none() {
      return runs[0].outputs.clone().map(serde_json::Value::Object);
    }
    runs.sort_by_key(|r| r.iteration);
    Some(serde_json::Value::Array(
      runs
        .into_iter()
        .map(|r| {
          r.outputs
            .clone()
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Null)
        })
        .collect(),
    ))
  }

  /// Whether any task run in `branch` is still waiting or running.
  pub fn has_outstanding(&self, branch: Branch) -> bool {
    self
      .task_runs
      .iter()
      .any(|r| r.branch == branch && !r.is_terminal())
  }

  pub fn outstanding_runs(&self) -> impl Iterator<Item = &TaskRun> {
    self.task_runs.iter().filter(|r| !r.is_terminal())
  }
}

fn rank(state: TaskRunState) -> u8 {
  match state {
    TaskRunState::Failed => 4,
    TaskRunState::Killed => 3,
    TaskRunState::Warning => 2,
    TaskRunState::Success => 1,
    _ => 0,
  }
}

fn worse(a: TaskRunState, b: TaskRunState) -> TaskRunState {
  if rank(b) > rank(a) { b } else { a }
}
