use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use weft_store::{
  ExecutionState, FlowRef, ParentRef, TaskRunError, TaskRunState, TriggeringContext,
};

use crate::QueueError;

/// Named streams of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
  /// Everything the executor consumes.
  Executor,
  /// Task-run start requests, competed for by workers.
  WorkerJobs,
  /// Cancellation signals, broadcast to every worker.
  WorkerControl,
  /// Execution state changes for observers.
  ExecutionUpdates,
  /// Messages that exceeded their delivery budget.
  DeadLetter,
}

impl Topic {
  pub fn as_str(self) -> &'static str {
    match self {
      Topic::Executor => "executor",
      Topic::WorkerJobs => "worker_jobs",
      Topic::WorkerControl => "worker_control",
      Topic::ExecutionUpdates => "execution_updates",
      Topic::DeadLetter => "dead_letter",
    }
  }
}

impl FromStr for Topic {
  type Err = QueueError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "executor" => Ok(Topic::Executor),
      "worker_jobs" => Ok(Topic::WorkerJobs),
      "worker_control" => Ok(Topic::WorkerControl),
      "execution_updates" => Ok(Topic::ExecutionUpdates),
      "dead_letter" => Ok(Topic::DeadLetter),
      other => Err(QueueError::UnknownTopic(other.to_string())),
    }
  }
}

impl fmt::Display for Topic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An execution was created or changed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
  pub execution_id: String,
  pub flow: FlowRef,
  pub state: ExecutionState,
  pub trigger: TriggeringContext,
  #[serde(default)]
  pub inputs: Map<String, Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent: Option<ParentRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunStart {
  pub execution_id: String,
  pub flow: FlowRef,
  pub task_id: String,
  pub task_type: String,
  pub iteration: u32,
  pub attempt: u32,
  pub resolved_config: Value,
  /// Variable scope for templates the plugin renders lazily.
  #[serde(default)]
  pub variables: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

impl TaskRunStart {
  pub fn attempt_key(&self) -> String {
    attempt_key(&self.execution_id, &self.task_id, self.iteration, self.attempt)
  }
}

/// Key fencing a single task-run attempt across workers.
pub fn attempt_key(execution_id: &str, task_id: &str, iteration: u32, attempt: u32) -> String {
  format!("taskrun/{execution_id}/{task_id}/{iteration}/{attempt}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunStarted {
  pub execution_id: String,
  pub task_id: String,
  pub iteration: u32,
  pub attempt: u32,
  pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunHeartbeat {
  pub execution_id: String,
  pub task_id: String,
  pub iteration: u32,
  pub attempt: u32,
  pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunEnded {
  pub execution_id: String,
  pub task_id: String,
  pub iteration: u32,
  pub attempt: u32,
  pub state: TaskRunState,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub outputs: Option<Map<String, Value>>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub warnings: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<TaskRunError>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub worker_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillRequest {
  pub execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseRequest {
  pub execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
  pub execution_id: String,
}

/// Ask the worker running an attempt to stop it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskRun {
  pub execution_id: String,
  pub task_id: String,
  pub iteration: u32,
  pub attempt: u32,
}

impl CancelTaskRun {
  pub fn attempt_key(&self) -> String {
    attempt_key(&self.execution_id, &self.task_id, self.iteration, self.attempt)
  }
}

/// A flowable task asks for a child execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSubflow {
  pub parent: ParentRef,
  pub namespace: String,
  pub flow_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub revision: Option<u32>,
  #[serde(default)]
  pub inputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
  pub topic: Topic,
  pub deliveries: u32,
  pub message: Box<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
  ExecutionEvent(ExecutionEvent),
  TaskRunStart(TaskRunStart),
  TaskRunStarted(TaskRunStarted),
  TaskRunHeartbeat(TaskRunHeartbeat),
  TaskRunEnded(TaskRunEnded),
  KillRequest(KillRequest),
  PauseRequest(PauseRequest),
  ResumeRequest(ResumeRequest),
  CancelTaskRun(CancelTaskRun),
  SpawnSubflow(SpawnSubflow),
  DeadLetter(DeadLetter),
}

impl Message {
  pub fn kind(&self) -> &'static str {
    match self {
      Message::ExecutionEvent(_) => "execution_event",
      Message::TaskRunStart(_) => "task_run_start",
      Message::TaskRunStarted(_) => "task_run_started",
      Message::TaskRunHeartbeat(_) => "task_run_heartbeat",
      Message::TaskRunEnded(_) => "task_run_ended",
      Message::KillRequest(_) => "kill_request",
      Message::PauseRequest(_) => "pause_request",
      Message::ResumeRequest(_) => "resume_request",
      Message::CancelTaskRun(_) => "cancel_task_run",
      Message::SpawnSubflow(_) => "spawn_subflow",
      Message::DeadLetter(_) => "dead_letter",
    }
  }

  /// The execution a message belongs to, used as its partition key.
  pub fn execution_id(&self) -> &str {
    match self {
      Message::ExecutionEvent(m) => &m.execution_id,
      Message::TaskRunStart(m) => &m.execution_id,
      Message::TaskRunStarted(m) => &m.execution_id,
      Message::TaskRunHeartbeat(m) => &m.execution_id,
      Message::TaskRunEnded(m) => &m.execution_id,
      Message::KillRequest(m) => &m.execution_id,
      Message::PauseRequest(m) => &m.execution_id,
      Message::ResumeRequest(m) => &m.execution_id,
      Message::CancelTaskRun(m) => &m.execution_id,
      Message::SpawnSubflow(m) => &m.parent.execution_id,
      Message::DeadLetter(m) => m.message.execution_id(),
    }
  }
}

pub fn encode(message: &Message) -> Result<Vec<u8>, QueueError> {
  Ok(serde_json::to_vec(message)?)
}

pub fn decode(payload: &[u8]) -> Result<Message, QueueError> {
  Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_shape() {
    let message = Message::TaskRunEnded(TaskRunEnded {
      execution_id: "e1".to_string(),
      task_id: "a".to_string(),
      iteration: 0,
      attempt: 2,
      state: TaskRunState::Success,
      outputs: Some(Map::from_iter([("x".to_string(), json!(1))])),
      warnings: vec![],
      error: None,
      worker_id: Some("w1".to_string()),
    });

    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(value["type"], "taskRunEnded");
    assert_eq!(value["executionId"], "e1");
    assert_eq!(value["state"], "SUCCESS");
    assert_eq!(value["outputs"]["x"], 1);
    assert!(value.get("error").is_none());

    assert_eq!(decode(&encode(&message).unwrap()).unwrap(), message);
  }

  #[test]
  fn test_dead_letter_partition_key() {
    let inner = Message::KillRequest(KillRequest {
      execution_id: "e9".to_string(),
    });
    let message = Message::DeadLetter(DeadLetter {
      topic: Topic::Executor,
      deliveries: 5,
      message: Box::new(inner),
    });
    assert_eq!(message.execution_id(), "e9");
    assert_eq!(message.kind(), "dead_letter");
  }

  #[test]
  fn test_topic_names_round_trip() {
    for topic in [
      Topic::Executor,
      Topic::WorkerJobs,
      Topic::WorkerControl,
      Topic::ExecutionUpdates,
      Topic::DeadLetter,
    ] {
      assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
    }
    assert!("nope".parse::<Topic>().is_err());
  }

  #[test]
  fn test_attempt_key() {
    let start = TaskRunStart {
      execution_id: "e1".to_string(),
      flow: FlowRef::new("ns", "f", 1),
      task_id: "a".to_string(),
      task_type: "core.Log".to_string(),
      iteration: 3,
      attempt: 2,
      resolved_config: json!({}),
      variables: Value::Null,
      timeout_ms: None,
    };
    assert_eq!(start.attempt_key(), "taskrun/e1/a/3/2");
  }
}
