//! End-to-end tests running the scheduler, executor and workers together
//! over an in-memory queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weft_engine::{Engine, EngineConfig, EngineError};
use weft_plugin::{Capability, Output, Plugin, PluginInfo, PluginRegistry, Task, TaskContext, TaskError};
use weft_queue::{ExecutionEvent, MemoryQueue, Message, Queue, Topic};
use weft_store::{
  Clock, ErrorKind, Execution, ExecutionState, FlowRef, SkipReason, TaskRunState, TriggerKind,
  TriggeringContext,
};

const TIMEOUT: Duration = Duration::from_secs(600);

/// Records the id of every task it runs, in order.
struct Record {
  info: PluginInfo,
  log: Arc<Mutex<Vec<String>>>,
}

impl Plugin for Record {
  fn info(&self) -> &PluginInfo {
    &self.info
  }
}

#[async_trait]
impl Task for Record {
  async fn run(&self, ctx: &dyn TaskContext, _config: &Value) -> Result<Output, TaskError> {
    self.log.lock().unwrap().push(ctx.task_id().to_string());
    Ok(Output::from_value(json!({ "iteration": ctx.iteration() })))
  }
}

struct Harness {
  engine: Arc<Engine>,
  queue: MemoryQueue,
  log: Arc<Mutex<Vec<String>>>,
  cancel: CancellationToken,
  handle: JoinHandle<Result<(), EngineError>>,
}

impl Harness {
  async fn start(flows: &[&str]) -> Self {
    Self::start_with(EngineConfig::default(), flows).await
  }

  async fn start_with(config: EngineConfig, flows: &[&str]) -> Self {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = PluginRegistry::new();
    weft_core_plugins::register_all(&mut registry).unwrap();
    registry
      .register_instance(Capability::Task(Arc::new(Record {
        info: PluginInfo::new("test.Record", "1.0.0", "Record"),
        log: log.clone(),
      })))
      .unwrap();

    let queue = MemoryQueue::with_max_deliveries(config.executor.max_deliveries);
    let clock = Clock::starting_at(Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 30).unwrap());
    let engine = Engine::builder(config, registry)
      .queue(Arc::new(queue.clone()))
      .clock(clock)
      .build()
      .await
      .unwrap();
    for flow in flows {
      engine.deploy_str(flow).await.unwrap();
    }

    let engine = Arc::new(engine);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(engine.clone().start(cancel.clone()));
    Self {
      engine,
      queue,
      log,
      cancel,
      handle,
    }
  }

  fn recorded(&self) -> Vec<String> {
    self.log.lock().unwrap().clone()
  }

  async fn run(&self, flow_id: &str, inputs: Value) -> Execution {
    let inputs = match inputs {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    let id = self.engine.submit("demo", flow_id, inputs).await.unwrap();
    self.engine.wait_for(&id, TIMEOUT).await.unwrap()
  }

  /// Poll until `check` holds for the execution.
  async fn wait_until(&self, id: &str, check: impl Fn(&Execution) -> bool) -> Execution {
    for _ in 0..6_000 {
      if let Some(execution) = self.engine.execution(id).await.unwrap() {
        if check(&execution) {
          return execution;
        }
      }
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("execution {id} never reached the expected state");
  }

  async fn stop(self) {
    self.cancel.cancel();
    self.handle.await.unwrap().unwrap();
  }
}

fn run_state(execution: &Execution, task_id: &str) -> Option<TaskRunState> {
  execution.run(task_id, 0).map(|run| run.state)
}

const LINEAR: &str = r#"
id: linear
namespace: demo
tasks:
  - id: a
    type: test.Record
  - id: b
    type: test.Record
  - id: c
    type: test.Record
"#;

#[tokio::test(start_paused = true)]
async fn test_linear_chain_runs_each_task_once_in_order() {
  let h = Harness::start(&[LINEAR]).await;

  let execution = h.run("linear", json!({})).await;

  assert_eq!(execution.state, ExecutionState::Success);
  assert_eq!(h.recorded(), vec!["a", "b", "c"]);
  for task_id in ["a", "b", "c"] {
    let run = execution.run(task_id, 0).unwrap();
    assert_eq!(run.state, TaskRunState::Success);
    assert_eq!(run.attempt, 1);
  }
  let states: Vec<_> = execution.history.iter().map(|c| c.state).collect();
  assert_eq!(
    states,
    vec![
      ExecutionState::Created,
      ExecutionState::Running,
      ExecutionState::Success
    ]
  );
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_outputs_flow_downstream() {
  let flow = r#"
id: outputs
namespace: demo
tasks:
  - id: a
    type: io.weft.core.output.OutputValues
    values:
      x: 1
  - id: b
    type: io.weft.core.debug.Return
    format: "{{ outputs.a.x + 1 }}"
"#;
  let h = Harness::start(&[flow]).await;

  let execution = h.run("outputs", json!({})).await;

  assert_eq!(execution.state, ExecutionState::Success);
  assert_eq!(execution.outputs["a"]["x"], json!(1));
  assert_eq!(execution.outputs["b"]["value"], json!("2"));
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_retries_until_max_attempts() {
  let flow = r#"
id: flaky
namespace: demo
tasks:
  - id: a
    type: io.weft.core.execution.Fail
    errorMessage: boom
    retry:
      type: constant
      interval: 1000
      maxAttempts: 3
"#;
  let h = Harness::start(&[flow]).await;

  let execution = h.run("flaky", json!({})).await;

  assert_eq!(execution.state, ExecutionState::Failed);
  let run = execution.run("a", 0).unwrap();
  assert_eq!(run.state, TaskRunState::Failed);
  assert_eq!(run.attempt, 3);
  assert_eq!(run.attempts.len(), 3);
  assert!(
    run
      .attempts
      .iter()
      .all(|a| a.state == TaskRunState::Failed)
  );
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_allow_failure_warns_and_skips_dependents() {
  let flow = r#"
id: tolerant
namespace: demo
tasks:
  - id: a
    type: io.weft.core.execution.Fail
    allowFailure: true
  - id: b
    type: test.Record
    dependsOn: [a]
"#;
  let h = Harness::start(&[flow]).await;

  let execution = h.run("tolerant", json!({})).await;

  assert_eq!(execution.state, ExecutionState::Warning);
  assert_eq!(run_state(&execution, "a"), Some(TaskRunState::Failed));
  assert_eq!(execution.task_state("b"), Some(TaskRunState::Skipped));
  assert_eq!(execution.skip_reason("b"), Some(SkipReason::UpstreamFailed));
  assert!(h.recorded().is_empty());
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_run() {
  let flow = r#"
id: slow
namespace: demo
tasks:
  - id: a
    type: io.weft.core.flow.Sleep
    duration: 10000
    timeout: 5000
"#;
  let h = Harness::start(&[flow]).await;

  let execution = h.run("slow", json!({})).await;

  assert_eq!(execution.state, ExecutionState::Failed);
  let run = execution.run("a", 0).unwrap();
  assert_eq!(run.state, TaskRunState::Failed);
  assert_eq!(run.error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_kill_running_execution() {
  let flow = r#"
id: long
namespace: demo
tasks:
  - id: a
    type: io.weft.core.flow.Sleep
    duration: 600000
  - id: b
    type: test.Record
"#;
  let h = Harness::start(&[flow]).await;

  let id = h.engine.submit("demo", "long", Map::new()).await.unwrap();
  h.wait_until(&id, |e| run_state(e, "a") == Some(TaskRunState::Running))
    .await;
  h.engine.kill(&id).await.unwrap();
  let execution = h.engine.wait_for(&id, TIMEOUT).await.unwrap();

  assert_eq!(execution.state, ExecutionState::Killed);
  let state = run_state(&execution, "a").unwrap();
  assert!(
    matches!(state, TaskRunState::Killed | TaskRunState::Failed),
    "unexpected state {state:?}"
  );
  assert!(execution.run("b", 0).is_none());
  assert!(h.recorded().is_empty());
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_for_each_runs_every_item() {
  let flow = r#"
id: fanout
namespace: demo
tasks:
  - id: a
    type: test.Record
    forEach: "inputs.items"
"#;
  let h = Harness::start(&[flow]).await;

  let execution = h.run("fanout", json!({ "items": ["x", "y", "z"] })).await;

  assert_eq!(execution.state, ExecutionState::Success);
  assert_eq!(h.recorded().len(), 3);
  assert_eq!(execution.runs_for("a").count(), 3);
  let outputs = execution.outputs["a"].as_array().unwrap();
  assert_eq!(outputs.len(), 3);
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_error_branch_and_listeners() {
  let flow = r#"
id: handled
namespace: demo
tasks:
  - id: a
    type: io.weft.core.execution.Fail
errors:
  - id: handler
    type: test.Record
listeners:
  - id: notify
    type: test.Record
"#;
  let h = Harness::start(&[flow]).await;

  let execution = h.run("handled", json!({})).await;

  assert_eq!(execution.state, ExecutionState::Failed);
  assert_eq!(h.recorded(), vec!["handler", "notify"]);
  assert_eq!(run_state(&execution, "handler"), Some(TaskRunState::Success));
  assert_eq!(run_state(&execution, "notify"), Some(TaskRunState::Success));
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_subflow_completes_parent() {
  let child = r#"
id: child
namespace: demo
tasks:
  - id: greet
    type: io.weft.core.debug.Return
    format: "hello {{ inputs.name }}"
"#;
  let parent = r#"
id: parent
namespace: demo
tasks:
  - id: call
    type: io.weft.core.flow.Subflow
    namespace: demo
    flowId: child
    inputs:
      name: weft
  - id: after
    type: test.Record
"#;
  let h = Harness::start(&[child, parent]).await;

  let execution = h.run("parent", json!({})).await;

  assert_eq!(execution.state, ExecutionState::Success);
  assert_eq!(h.recorded(), vec!["after"]);
  let call = execution.run("call", 0).unwrap();
  let child_id = call.subflow_execution_id.clone().unwrap();

  let child = h.engine.execution(&child_id).await.unwrap().unwrap();
  assert_eq!(child.state, ExecutionState::Success);
  assert_eq!(child.trigger.kind, TriggerKind::Subflow);
  assert_eq!(child.parent.as_ref().unwrap().execution_id, execution.id);
  assert_eq!(child.outputs["greet"]["value"], json!("hello weft"));
  assert_eq!(h.engine.executions("demo", "child").await.unwrap().len(), 1);
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_subflow_fails_parent_task() {
  let child = r#"
id: broken
namespace: demo
tasks:
  - id: a
    type: io.weft.core.execution.Fail
"#;
  let parent = r#"
id: caller
namespace: demo
tasks:
  - id: call
    type: io.weft.core.flow.Subflow
    namespace: demo
    flowId: broken
"#;
  let h = Harness::start(&[child, parent]).await;

  let execution = h.run("caller", json!({})).await;

  assert_eq!(execution.state, ExecutionState::Failed);
  let call = execution.run("call", 0).unwrap();
  assert_eq!(call.error.as_ref().map(|e| e.kind), Some(ErrorKind::Subflow));
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_kill_parent_kills_running_subflow() {
  let child = r#"
id: slow
namespace: demo
tasks:
  - id: wait
    type: io.weft.core.flow.Sleep
    duration: 600000
"#;
  let parent = r#"
id: waiter
namespace: demo
tasks:
  - id: call
    type: io.weft.core.flow.Subflow
    namespace: demo
    flowId: slow
  - id: after
    type: test.Record
"#;
  let h = Harness::start(&[child, parent]).await;

  let id = h.engine.submit("demo", "waiter", Map::new()).await.unwrap();
  let running = h
    .wait_until(&id, |e| {
      e.run("call", 0)
        .is_some_and(|r| r.subflow_execution_id.is_some())
    })
    .await;
  let child_id = running
    .run("call", 0)
    .and_then(|r| r.subflow_execution_id.clone())
    .unwrap();
  h.wait_until(&child_id, |e| run_state(e, "wait") == Some(TaskRunState::Running))
    .await;

  h.engine.kill(&id).await.unwrap();
  let execution = h.engine.wait_for(&id, TIMEOUT).await.unwrap();
  let child = h.engine.wait_for(&child_id, TIMEOUT).await.unwrap();

  assert_eq!(execution.state, ExecutionState::Killed);
  assert_eq!(run_state(&execution, "call"), Some(TaskRunState::Killed));
  assert!(execution.run("after", 0).is_none());
  assert_eq!(child.state, ExecutionState::Killed);
  assert_ne!(run_state(&child, "wait"), Some(TaskRunState::Success));
  assert!(h.recorded().is_empty());
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_schedule_fires_once_per_occurrence() {
  let flow = r#"
id: minutely
namespace: demo
tasks:
  - id: a
    type: test.Record
triggers:
  - id: every-minute
    type: io.weft.core.trigger.Schedule
    cron: "* * * * *"
"#;
  let h = Harness::start(&[flow]).await;

  // 10:00:30 → 10:02:50 spans the 10:01 and 10:02 occurrences.
  tokio::time::sleep(Duration::from_secs(140)).await;

  let executions = h.engine.executions("demo", "minutely").await.unwrap();
  assert_eq!(executions.len(), 2);
  let mut keys: Vec<_> = executions
    .iter()
    .map(|e| e.trigger.fire_key.clone().unwrap())
    .collect();
  keys.sort();
  assert_eq!(
    keys,
    vec!["2026-01-01T10:01:00+00:00", "2026-01-01T10:02:00+00:00"]
  );
  for execution in &executions {
    assert_eq!(execution.trigger.kind, TriggerKind::Schedule);
    let done = h.engine.wait_for(&execution.id, TIMEOUT).await.unwrap();
    assert_eq!(done.state, ExecutionState::Success);
  }
  assert_eq!(h.recorded().len(), 2);
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_create_runs_once() {
  let h = Harness::start(&[LINEAR]).await;

  let event = Message::ExecutionEvent(ExecutionEvent {
    execution_id: "dup-1".to_string(),
    flow: FlowRef::new("demo", "linear", 1),
    state: ExecutionState::Created,
    trigger: TriggeringContext::manual(),
    inputs: Map::new(),
    parent: None,
  });
  h.queue.publish(Topic::Executor, event.clone()).await.unwrap();
  h.queue.publish(Topic::Executor, event).await.unwrap();

  let execution = h.engine.wait_for("dup-1", TIMEOUT).await.unwrap();
  assert_eq!(execution.state, ExecutionState::Success);

  // Give a late duplicate time to be handled.
  tokio::time::sleep(Duration::from_secs(10)).await;
  assert_eq!(h.recorded(), vec!["a", "b", "c"]);
  assert_eq!(h.engine.executions("demo", "linear").await.unwrap().len(), 1);
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_many_workers_run_each_attempt_once() {
  let flow = r#"
id: wide
namespace: demo
tasks:
  - id: a
    type: test.Record
    forEach: "inputs.items"
"#;
  let config = EngineConfig {
    workers: 3,
    ..EngineConfig::default()
  };
  let h = Harness::start_with(config, &[flow]).await;

  let execution = h
    .run("wide", json!({ "items": [1, 2, 3, 4, 5, 6, 7, 8] }))
    .await;

  assert_eq!(execution.state, ExecutionState::Success);
  assert_eq!(h.recorded().len(), 8);
  for run in execution.runs_for("a") {
    assert_eq!(run.attempt, 1);
    assert_eq!(run.attempts.len(), 1);
  }
  h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_new_runs_until_resumed() {
  let flow = r#"
id: pausable
namespace: demo
tasks:
  - id: a
    type: io.weft.core.flow.Sleep
    duration: 5000
  - id: b
    type: test.Record
"#;
  let h = Harness::start(&[flow]).await;

  let id = h.engine.submit("demo", "pausable", Map::new()).await.unwrap();
  h.wait_until(&id, |e| run_state(e, "a") == Some(TaskRunState::Running))
    .await;
  h.engine.pause(&id).await.unwrap();
  h.wait_until(&id, |e| e.state == ExecutionState::Paused).await;

  // The in-flight run finishes; nothing new starts.
  h.wait_until(&id, |e| run_state(e, "a") == Some(TaskRunState::Success))
    .await;
  tokio::time::sleep(Duration::from_secs(10)).await;
  let paused = h.engine.execution(&id).await.unwrap().unwrap();
  assert_eq!(paused.state, ExecutionState::Paused);
  assert!(paused.run("b", 0).is_none());
  assert!(h.recorded().is_empty());

  h.engine.resume(&id).await.unwrap();
  let execution = h.engine.wait_for(&id, TIMEOUT).await.unwrap();
  assert_eq!(execution.state, ExecutionState::Success);
  assert_eq!(h.recorded(), vec!["b"]);
  h.stop().await;
}
