use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use weft_flow::{Expressions, Flow, FlowRepository};
use weft_queue::{
  DeadLetter, Delivery, ExecutionEvent, Message, Queue, SpawnSubflow, Topic,
};
use weft_store::{
  Clock, ErrorKind, Execution, ExecutionRepository, ExecutionState, LeaseStore, TaskRunError,
};

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;
use crate::machine::{Machine, ScanLimits, needs_scan, reject};

/// Consumer group shared by all executor instances.
pub const EXECUTOR_GROUP: &str = "executor";

const BUSY_RETRY: Duration = Duration::from_millis(250);
const FAILURE_BACKOFF: Duration = Duration::from_millis(500);

/// The only writer of execution state.
///
/// Messages for one execution are serialized twice over: a local mutex per
/// execution id, and a lease in the shared [`LeaseStore`] so that several
/// executor instances never interleave on the same execution.
pub struct Executor {
  config: ExecutorConfig,
  flows: Arc<FlowRepository>,
  executions: Arc<dyn ExecutionRepository>,
  leases: Arc<dyn LeaseStore>,
  queue: Arc<dyn Queue>,
  expressions: Expressions,
  clock: Clock,
  locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Executor {
  pub fn new(
    config: ExecutorConfig,
    flows: Arc<FlowRepository>,
    executions: Arc<dyn ExecutionRepository>,
    leases: Arc<dyn LeaseStore>,
    queue: Arc<dyn Queue>,
    clock: Clock,
  ) -> Self {
    Self {
      config,
      flows,
      executions,
      leases,
      queue,
      expressions: Expressions::new(),
      clock,
      locks: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_expressions(mut self, expressions: Expressions) -> Self {
    self.expressions = expressions;
    self
  }

  pub fn id(&self) -> &str {
    &self.config.instance_id
  }

  /// Consume executor messages and run the deadline scan until `cancel`
  /// fires or the queue closes.
  pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ExecutorError> {
    let mut inbox = self.queue.subscribe(Topic::Executor, EXECUTOR_GROUP).await?;
    let mut dead_letters = self
      .queue
      .subscribe(Topic::DeadLetter, EXECUTOR_GROUP)
      .await?;
    let permits = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
    let mut handlers = JoinSet::new();
    let mut scan = tokio::time::interval(Duration::from_millis(
      self.config.orphan_scan_interval_ms.max(1),
    ));
    scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
      instance_id = %self.config.instance_id,
      parallelism = self.config.parallelism,
      "executor started"
    );

    loop {
      let permit = tokio::select! {
        _ = cancel.cancelled() => break,
        _ = scan.tick() => {
          if let Err(e) = self.scan().await {
            error!(error = %e, "deadline scan failed");
          }
          continue;
        }
        permit = permits.clone().acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => break,
        },
      };

      let delivery = tokio::select! {
        _ = cancel.cancelled() => break,
        delivery = inbox.next() => delivery,
        delivery = dead_letters.next() => delivery,
      };
      let Some(delivery) = delivery else {
        break;
      };

      let executor = self.clone();
      handlers.spawn(async move {
        executor.handle(delivery).await;
        drop(permit);
      });

      while let Some(joined) = handlers.try_join_next() {
        if let Err(e) = joined {
          error!(instance_id = %self.config.instance_id, error = %e, "message handler panicked");
        }
      }
    }

    handlers.shutdown().await;
    info!(instance_id = %self.config.instance_id, "executor stopped");
    Ok(())
  }

  #[instrument(
    name = "executor_message",
    skip(self, delivery),
    fields(
      kind = delivery.message().kind(),
      execution_id = %delivery.message().execution_id(),
    )
  )]
  async fn handle(&self, delivery: Delivery) {
    let message = delivery.message().clone();
    match self.process(message).await {
      Ok(()) => delivery.ack(),
      Err(ExecutorError::Busy(_)) => {
        debug!("execution owned elsewhere, retrying later");
        delivery.retry_after(BUSY_RETRY);
      }
      Err(e) => {
        let deliveries = delivery.deliveries();
        warn!(deliveries, error = %e, "message handling failed");
        delivery.retry_after(FAILURE_BACKOFF * deliveries.max(1));
      }
    }
  }

  /// Apply one message. Exposed so callers without a running loop (tests,
  /// embedding) can drive the executor directly.
  pub async fn process(&self, message: Message) -> Result<(), ExecutorError> {
    match message {
      Message::ExecutionEvent(event) => self.create(event).await,
      Message::SpawnSubflow(spawn) => self.spawn_subflow(spawn).await,
      Message::DeadLetter(letter) => self.dead_letter(letter).await,
      Message::TaskRunStarted(m) => {
        self
          .update(&m.execution_id, |machine, ex| machine.task_run_started(ex, &m))
          .await
      }
      Message::TaskRunHeartbeat(m) => {
        self
          .update(&m.execution_id, |machine, ex| machine.heartbeat(ex, &m))
          .await
      }
      Message::TaskRunEnded(m) => {
        self
          .update(&m.execution_id, |machine, ex| machine.task_run_ended(ex, &m))
          .await
      }
      Message::KillRequest(m) => self.update(&m.execution_id, |machine, ex| machine.kill(ex)).await,
      Message::PauseRequest(m) => {
        self
          .update(&m.execution_id, |machine, ex| machine.pause(ex))
          .await
      }
      Message::ResumeRequest(m) => {
        self
          .update(&m.execution_id, |machine, ex| machine.resume(ex))
          .await
      }
      other => {
        warn!(kind = other.kind(), "unexpected message on executor topic");
        Ok(())
      }
    }
  }

  /// Create and start an execution. Creating an id that already exists is a
  /// no-op, so repeated creation requests are harmless.
  async fn create(&self, event: ExecutionEvent) -> Result<(), ExecutorError> {
    if event.state != ExecutionState::Created {
      debug!(state = %event.state, "ignoring execution event");
      return Ok(());
    }

    let execution_id = event.execution_id.clone();
    self
      .with_lease(&execution_id, async {
        let now = self.clock.now();
        let mut execution = match self.executions.find(&execution_id).await? {
          Some(existing) if existing.state != ExecutionState::Created => {
            debug!("execution already exists");
            return self.flush_outbox(existing).await.map(drop);
          }
          Some(existing) => existing,
          None => Execution::new(
            execution_id.clone(),
            event.flow.clone(),
            event.trigger,
            event.inputs,
            event.parent,
            now,
          ),
        };

        match self.flow_for(&execution).await {
          Ok(flow) if flow.disabled => {
            let error = TaskRunError::new(
              ErrorKind::Resolution,
              format!("flow {} is disabled", execution.flow),
            );
            reject(&mut execution, error, now)?;
          }
          Ok(flow) => {
            Machine::new(&flow, &self.expressions, now).start(&mut execution)?;
          }
          Err(ExecutorError::FlowNotFound(flow)) => {
            let error = TaskRunError::new(ErrorKind::Resolution, format!("flow {flow} not found"));
            reject(&mut execution, error, now)?;
          }
          Err(e) => return Err(e),
        }

        info!(flow = %execution.flow, trigger = ?execution.trigger.kind, "execution created");
        self.executions.save(&mut execution).await?;
        self.flush_outbox(execution).await.map(drop)
      })
      .await
  }

  async fn spawn_subflow(&self, spawn: SpawnSubflow) -> Result<(), ExecutorError> {
    let parent = spawn.parent;
    let child_id = Uuid::new_v5(
      &Uuid::NAMESPACE_OID,
      format!(
        "{}/{}/{}/{}",
        parent.execution_id, parent.task_id, parent.iteration, parent.attempt
      )
      .as_bytes(),
    )
    .to_string();
    let child_flow = self
      .flows
      .find(&spawn.namespace, &spawn.flow_id, spawn.revision)
      .await
      .map(|flow| flow.reference())
      .ok_or_else(|| {
        let revision = spawn
          .revision
          .map_or_else(|| "latest".to_string(), |r| r.to_string());
        format!(
          "subflow {}.{}@{} not found",
          spawn.namespace, spawn.flow_id, revision
        )
      });

    let inputs = spawn.inputs;
    self
      .update(&parent.execution_id.clone(), move |machine, ex| {
        machine.subflow_requested(ex, &parent, &child_id, child_flow, inputs)
      })
      .await
  }

  async fn dead_letter(&self, letter: DeadLetter) -> Result<(), ExecutorError> {
    let execution_id = letter.message.execution_id().to_string();
    error!(
      topic = %letter.topic,
      kind = letter.message.kind(),
      deliveries = letter.deliveries,
      "message dead-lettered"
    );
    match self
      .update(&execution_id, |machine, ex| machine.dead_letter(ex, &letter))
      .await
    {
      Err(ExecutorError::ExecutionNotFound(_)) => {
        warn!(execution_id = %execution_id, "dead letter for unknown execution dropped");
        Ok(())
      }
      other => other,
    }
  }

  /// Check every active execution against its deadlines.
  pub async fn scan(&self) -> Result<usize, ExecutorError> {
    let now = self.clock.now();
    let limits = ScanLimits::from_millis(
      self.config.heartbeat_grace_ms,
      self.config.start_timeout_ms,
      self.config.kill_grace_ms,
    );

    let mut changed = 0;
    for execution in self.executions.list_active().await? {
      if !needs_scan(&execution, &limits, now) {
        continue;
      }
      let result = self
        .update(&execution.id, |machine, ex| machine.scan(ex, &limits))
        .await;
      match result {
        Ok(()) => changed += 1,
        Err(ExecutorError::Busy(_)) => {}
        Err(e) => warn!(execution_id = %execution.id, error = %e, "deadline scan failed"),
      }
    }
    Ok(changed)
  }

  /// Load the execution, apply `f`, and persist and publish the result.
  async fn update<F>(&self, execution_id: &str, f: F) -> Result<(), ExecutorError>
  where
    F: FnOnce(&Machine<'_>, &mut Execution) -> Result<bool, ExecutorError>,
  {
    self
      .with_lease(execution_id, async {
        let Some(execution) = self.executions.find(execution_id).await? else {
          return Err(ExecutorError::ExecutionNotFound(execution_id.to_string()));
        };
        // Leftovers from a crash between save and publish.
        let mut execution = self.flush_outbox(execution).await?;

        let flow = self.flow_for(&execution).await?;
        let machine = Machine::new(&flow, &self.expressions, self.clock.now());
        if f(&machine, &mut execution)? {
          self.executions.save(&mut execution).await?;
          self.flush_outbox(execution).await?;
        }
        Ok(())
      })
      .await
  }

  async fn with_lease<T>(
    &self,
    execution_id: &str,
    work: impl Future<Output = Result<T, ExecutorError>>,
  ) -> Result<T, ExecutorError> {
    let local = self.local_lock(execution_id);
    let _guard = local.lock().await;

    let ttl = Duration::from_millis(self.config.lease_ttl_ms);
    let key = format!("execution/{execution_id}");
    let Some(lease) = self.leases.acquire(&key, self.id(), ttl).await? else {
      return Err(ExecutorError::Busy(execution_id.to_string()));
    };

    let result = work.await;

    if let Err(e) = self.leases.release(&lease).await {
      warn!(execution_id = %execution_id, error = %e, "failed to release execution lease");
    }
    drop(_guard);
    self.release_local(execution_id, local);
    result
  }

  /// Publish and clear pending outbox entries, returning the saved copy.
  async fn flush_outbox(&self, mut execution: Execution) -> Result<Execution, ExecutorError> {
    if execution.outbox.is_empty() {
      return Ok(execution);
    }
    for entry in &execution.outbox {
      let topic: Topic = entry.topic.parse()?;
      let message: Message = serde_json::from_value(entry.message.clone())?;
      if entry.delay_ms > 0 {
        self
          .queue
          .publish_delayed(topic, message, Duration::from_millis(entry.delay_ms))
          .await?;
      } else {
        self.queue.publish(topic, message).await?;
      }
    }
    execution.outbox.clear();
    self.executions.save(&mut execution).await?;
    Ok(execution)
  }

  async fn flow_for(&self, execution: &Execution) -> Result<Arc<Flow>, ExecutorError> {
    let flow = &execution.flow;
    self
      .flows
      .find(&flow.namespace, &flow.id, Some(flow.revision))
      .await
      .ok_or_else(|| ExecutorError::FlowNotFound(flow.to_string()))
  }

  fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
    self.locks.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn local_lock(&self, execution_id: &str) -> Arc<tokio::sync::Mutex<()>> {
    self
      .locks()
      .entry(execution_id.to_string())
      .or_default()
      .clone()
  }

  fn release_local(&self, execution_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
    drop(lock);
    let mut locks = self.locks();
    if locks
      .get(execution_id)
      .is_some_and(|l| Arc::strong_count(l) == 1)
    {
      locks.remove(execution_id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::load;
  use serde_json::Map;
  use weft_queue::{MemoryQueue, TaskRunEnded, TaskRunStart};
  use weft_store::{
    MemoryExecutionRepository, MemoryLeaseStore, TaskRunState, TriggeringContext,
  };

  const FLOW: &str = "id: hello\nnamespace: test\ntasks:\n  - id: a\n    type: test.Noop\n";

  struct Harness {
    executor: Executor,
    executions: Arc<MemoryExecutionRepository>,
    leases: Arc<MemoryLeaseStore>,
    queue: MemoryQueue,
  }

  async fn harness() -> Harness {
    let flows = Arc::new(FlowRepository::new());
    flows.save(load(FLOW)).await;
    let executions = Arc::new(MemoryExecutionRepository::new());
    let clock = Clock::new();
    let leases = Arc::new(MemoryLeaseStore::new(clock));
    let queue = MemoryQueue::new();
    let executor = Executor::new(
      ExecutorConfig::default(),
      flows,
      executions.clone(),
      leases.clone(),
      Arc::new(queue.clone()),
      clock,
    );
    Harness {
      executor,
      executions,
      leases,
      queue,
    }
  }

  fn created(id: &str, revision: u32) -> Message {
    Message::ExecutionEvent(ExecutionEvent {
      execution_id: id.to_string(),
      flow: weft_store::FlowRef::new("test", "hello", revision),
      state: ExecutionState::Created,
      trigger: TriggeringContext::manual(),
      inputs: Map::new(),
      parent: None,
    })
  }

  async fn next_start(queue: &MemoryQueue) -> TaskRunStart {
    let mut jobs = queue.subscribe(Topic::WorkerJobs, "workers").await.unwrap();
    let delivery = jobs.next().await.unwrap();
    let Message::TaskRunStart(start) = delivery.message().clone() else {
      panic!("expected a start message");
    };
    delivery.ack();
    start
  }

  #[tokio::test]
  async fn test_create_publishes_start() {
    let h = harness().await;
    h.executor.process(created("e1", 1)).await.unwrap();

    let start = next_start(&h.queue).await;
    assert_eq!(start.task_id, "a");
    let execution = h.executions.find("e1").await.unwrap().unwrap();
    assert_eq!(execution.state, ExecutionState::Running);
    assert!(execution.outbox.is_empty());
  }

  #[tokio::test]
  async fn test_duplicate_create_is_ignored() {
    let h = harness().await;
    let _jobs = h.queue.subscribe(Topic::WorkerJobs, "workers").await.unwrap();
    h.executor.process(created("e1", 1)).await.unwrap();
    let version = h.executions.find("e1").await.unwrap().unwrap().version;

    h.executor.process(created("e1", 1)).await.unwrap();
    let execution = h.executions.find("e1").await.unwrap().unwrap();
    assert_eq!(execution.version, version);
    assert_eq!(h.queue.depth(Topic::WorkerJobs, "workers"), 1);
  }

  #[tokio::test]
  async fn test_unknown_flow_fails_execution() {
    let h = harness().await;
    h.executor.process(created("e1", 7)).await.unwrap();

    let execution = h.executions.find("e1").await.unwrap().unwrap();
    assert_eq!(execution.state, ExecutionState::Failed);
    assert_eq!(execution.error.unwrap().kind, ErrorKind::Resolution);
  }

  #[tokio::test]
  async fn test_lease_held_elsewhere_is_busy() {
    let h = harness().await;
    h.executor.process(created("e1", 1)).await.unwrap();
    h.leases
      .acquire("execution/e1", "other", Duration::from_secs(30))
      .await
      .unwrap()
      .unwrap();

    let err = h
      .executor
      .process(Message::KillRequest(weft_queue::KillRequest {
        execution_id: "e1".to_string(),
      }))
      .await
      .unwrap_err();
    assert!(matches!(err, ExecutorError::Busy(_)));
  }

  #[tokio::test]
  async fn test_ended_completes_execution() {
    let h = harness().await;
    h.executor.process(created("e1", 1)).await.unwrap();
    let start = next_start(&h.queue).await;

    let ended = Message::TaskRunEnded(TaskRunEnded {
      execution_id: start.execution_id.clone(),
      task_id: start.task_id.clone(),
      iteration: 0,
      attempt: 1,
      state: TaskRunState::Success,
      outputs: None,
      warnings: Vec::new(),
      error: None,
      worker_id: Some("w1".to_string()),
    });
    h.executor.process(ended.clone()).await.unwrap();
    h.executor.process(ended).await.unwrap();

    let execution = h.executions.find("e1").await.unwrap().unwrap();
    assert_eq!(execution.state, ExecutionState::Success);
    assert_eq!(execution.task_runs.len(), 1);
  }
}
