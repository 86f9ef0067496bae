use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use weft_plugin::{Capability, Flowable, Output, PluginRegistry, Task, TaskError};
use weft_queue::{
  Delivery, Message, Queue, SpawnSubflow, TaskRunEnded, TaskRunHeartbeat, TaskRunStart,
  TaskRunStarted, Topic,
};
use weft_runtime::{RunContext, RunScope, Runtime};
use weft_store::{ErrorKind, LeaseStore, ParentRef, TaskRunError, TaskRunState};

use crate::cache::PluginCache;
use crate::config::WorkerConfig;
use crate::error::WorkerError;

/// Consumer group shared by all workers on [`Topic::WorkerJobs`].
pub const JOBS_GROUP: &str = "workers";

const CLAIM_RETRY: Duration = Duration::from_secs(1);

pub struct Worker {
  config: WorkerConfig,
  queue: Arc<dyn Queue>,
  leases: Arc<dyn LeaseStore>,
  plugins: PluginCache,
  runtime: Runtime,
  running: Mutex<HashMap<String, CancellationToken>>,
}

impl Worker {
  pub fn new(
    config: WorkerConfig,
    queue: Arc<dyn Queue>,
    leases: Arc<dyn LeaseStore>,
    registry: Arc<PluginRegistry>,
    runtime: Runtime,
  ) -> Self {
    let runtime = runtime.with_max_inline_output_bytes(config.max_inline_output_bytes);
    Self {
      config,
      queue,
      leases,
      plugins: PluginCache::new(registry),
      runtime,
      running: Mutex::new(HashMap::new()),
    }
  }

  pub fn id(&self) -> &str {
    &self.config.worker_id
  }

  /// Consume jobs until `cancel` fires or the queue closes.
  ///
  /// Runs still in flight at shutdown are aborted; their deliveries go back
  /// to the queue.
  pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), WorkerError> {
    let mut jobs = self.queue.subscribe(Topic::WorkerJobs, JOBS_GROUP).await?;
    let mut control = self
      .queue
      .subscribe(Topic::WorkerControl, &self.config.worker_id)
      .await?;
    let permits = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
    let mut runs = JoinSet::new();

    info!(
      worker_id = %self.config.worker_id,
      parallelism = self.config.parallelism,
      "worker started"
    );

    loop {
      let permit = tokio::select! {
        _ = cancel.cancelled() => break,
        Some(delivery) = control.next() => {
          self.handle_control(delivery);
          continue;
        }
        permit = permits.clone().acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => break,
        },
      };

      tokio::select! {
        _ = cancel.cancelled() => break,
        Some(delivery) = control.next() => self.handle_control(delivery),
        job = jobs.next() => match job {
          Some(delivery) => {
            let worker = self.clone();
            runs.spawn(async move {
              worker.handle_job(delivery).await;
              drop(permit);
            });
          }
          None => break,
        },
      }

      while let Some(joined) = runs.try_join_next() {
        if let Err(e) = joined {
          error!(worker_id = %self.config.worker_id, error = %e, "task run panicked");
        }
      }
    }

    runs.shutdown().await;
    info!(worker_id = %self.config.worker_id, "worker stopped");
    Ok(())
  }

  fn running(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    self.running.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn handle_control(&self, delivery: Delivery) {
    if let Message::CancelTaskRun(cancel) = delivery.message() {
      if let Some(token) = self.running().get(&cancel.attempt_key()) {
        info!(
          execution_id = %cancel.execution_id,
          task_id = %cancel.task_id,
          attempt = cancel.attempt,
          "task run cancel requested"
        );
        token.cancel();
      }
    }
    delivery.ack();
  }

  #[instrument(name = "task_run", skip(self, delivery), fields(worker_id = %self.config.worker_id))]
  async fn handle_job(&self, delivery: Delivery) {
    let Message::TaskRunStart(start) = delivery.message().clone() else {
      warn!(kind = delivery.message().kind(), "unexpected message on jobs topic");
      delivery.ack();
      return;
    };

    match self.claim(&start).await {
      Ok(true) => {}
      Ok(false) => {
        debug!(
          execution_id = %start.execution_id,
          task_id = %start.task_id,
          attempt = start.attempt,
          "attempt already claimed"
        );
        delivery.ack();
        return;
      }
      Err(e) => {
        error!(error = %e, "failed to claim attempt");
        delivery.retry_after(CLAIM_RETRY);
        return;
      }
    }

    let key = start.attempt_key();
    let result = self.execute(&start).await;
    self.running().remove(&key);

    match result {
      Ok(()) => {
        let retention = Duration::from_millis(self.config.claim_retention_ms);
        if let Err(e) = self.leases.acquire(&key, self.id(), retention).await {
          warn!(error = %e, "failed to retain attempt claim");
        }
        delivery.ack();
      }
      Err(e) => {
        // The claim is still held, so the redelivery is skipped and the
        // executor's orphan scan takes over once heartbeats stop.
        error!(error = %e, "failed to report task run");
        delivery.nack();
      }
    }
  }

  /// Take exclusive ownership of an attempt.
  async fn claim(&self, start: &TaskRunStart) -> Result<bool, WorkerError> {
    let key = start.attempt_key();
    {
      let mut running = self.running();
      if running.contains_key(&key) {
        return Ok(false);
      }
      running.insert(key.clone(), CancellationToken::new());
    }

    let claimed = match self.leases.holder(&key).await {
      Ok(Some(_)) => Ok(false),
      Ok(None) => {
        let ttl = Duration::from_millis(self.config.lease_ttl_ms);
        self
          .leases
          .acquire(&key, self.id(), ttl)
          .await
          .map(|lease| lease.is_some())
      }
      Err(e) => Err(e),
    };

    if !matches!(claimed, Ok(true)) {
      self.running().remove(&key);
    }
    Ok(claimed?)
  }

  async fn execute(&self, start: &TaskRunStart) -> Result<(), WorkerError> {
    let token = self
      .running()
      .get(&start.attempt_key())
      .cloned()
      .unwrap_or_default();

    self
      .queue
      .publish(
        Topic::Executor,
        Message::TaskRunStarted(TaskRunStarted {
          execution_id: start.execution_id.clone(),
          task_id: start.task_id.clone(),
          iteration: start.iteration,
          attempt: start.attempt,
          worker_id: self.config.worker_id.clone(),
        }),
      )
      .await?;

    let ended = match self.plugins.resolve(&start.task_type) {
      Ok(Capability::Task(task)) => Some(self.run_task(task.as_ref(), start, token).await),
      Ok(Capability::Flowable(flowable)) => {
        self
          .spawn_subflow(flowable.as_ref(), start, token)
          .await?
      }
      Ok(Capability::Trigger(_)) => Some(ended(
        start,
        TaskRunState::Failed,
        Output::empty(),
        Some(TaskRunError::new(
          ErrorKind::Resolution,
          format!("'{}' is a trigger and cannot run as a task", start.task_type),
        )),
      )),
      Err(e) => Some(ended(
        start,
        TaskRunState::Failed,
        Output::empty(),
        Some(TaskRunError::new(ErrorKind::Resolution, e.to_string())),
      )),
    };

    if let Some(mut ended) = ended {
      ended.worker_id = Some(self.config.worker_id.clone());
      self
        .queue
        .publish(Topic::Executor, Message::TaskRunEnded(ended))
        .await?;
    }
    Ok(())
  }

  fn context(&self, start: &TaskRunStart, token: CancellationToken) -> RunContext {
    let scope = RunScope {
      execution_id: start.execution_id.clone(),
      task_id: start.task_id.clone(),
      task_type: start.task_type.clone(),
      iteration: start.iteration,
      attempt: start.attempt,
      variables: start.variables.clone(),
    };
    self.runtime.context(scope, token)
  }

  async fn run_task(
    &self,
    task: &dyn Task,
    start: &TaskRunStart,
    token: CancellationToken,
  ) -> TaskRunEnded {
    let ctx = self.context(start, token.clone());
    let timeout_ms = start.timeout_ms.or(self.config.default_timeout_ms);

    info!(
      execution_id = %start.execution_id,
      task_id = %start.task_id,
      task_type = %start.task_type,
      iteration = start.iteration,
      attempt = start.attempt,
      "task run started"
    );

    let result = {
      let invocation = async {
        match timeout_ms {
          Some(ms) => {
            let limit = Duration::from_millis(ms);
            tokio::time::timeout(limit, task.run(&ctx, &start.resolved_config))
              .await
              .unwrap_or(Err(TaskError::Timeout { timeout_ms: ms }))
          }
          None => task.run(&ctx, &start.resolved_config).await,
        }
      };

      tokio::select! {
        result = invocation => result,
        _ = token.cancelled() => Err(TaskError::Cancelled),
        _ = self.heartbeat(start) => Err(TaskError::failed("heartbeat loop stopped")),
      }
    };

    let outcome = match result {
      Ok(Output { values, warnings }) => match ctx.offload(values).await {
        Ok(values) => {
          let state = if warnings.is_empty() {
            TaskRunState::Success
          } else {
            TaskRunState::Warning
          };
          let warnings = warnings.iter().map(|w| ctx.redact(w)).collect();
          ended(start, state, Output { values, warnings }, None)
        }
        Err(e) => failed(start, ErrorKind::Task, e.to_string()),
      },
      Err(TaskError::Cancelled) => ended(
        start,
        TaskRunState::Killed,
        Output::empty(),
        Some(TaskRunError::new(ErrorKind::Cancelled, "task run cancelled")),
      ),
      Err(e @ TaskError::Timeout { .. }) => failed(start, ErrorKind::Timeout, e.to_string()),
      Err(e) => failed(start, ErrorKind::Task, ctx.redact(&e.to_string())),
    };

    let summary = ctx.close();
    match &outcome.error {
      None => info!(
        execution_id = %start.execution_id,
        task_id = %start.task_id,
        state = %outcome.state,
        log_lines = summary.logs.len(),
        "task run completed"
      ),
      Some(error) => error!(
        execution_id = %start.execution_id,
        task_id = %start.task_id,
        state = %outcome.state,
        error = %error.message,
        log_lines = summary.logs.len(),
        "task run failed"
      ),
    }

    outcome
  }

  /// Ask the executor for a child execution. Returns the terminal event only
  /// when the plugin failed; otherwise the task ends with the child.
  async fn spawn_subflow(
    &self,
    flowable: &dyn Flowable,
    start: &TaskRunStart,
    token: CancellationToken,
  ) -> Result<Option<TaskRunEnded>, WorkerError> {
    let ctx = self.context(start, token);
    let spec = flowable
      .subflow(&ctx, &start.resolved_config)
      .await
      .and_then(|spec| {
        let inputs = subflow_inputs(spec.inputs.clone())?;
        Ok((spec, inputs))
      });

    let outcome = match spec {
      Ok((spec, inputs)) => {
        info!(
          execution_id = %start.execution_id,
          task_id = %start.task_id,
          namespace = %spec.namespace,
          flow_id = %spec.flow_id,
          "subflow requested"
        );
        self
          .queue
          .publish(
            Topic::Executor,
            Message::SpawnSubflow(SpawnSubflow {
              parent: ParentRef {
                execution_id: start.execution_id.clone(),
                task_id: start.task_id.clone(),
                iteration: start.iteration,
                attempt: start.attempt,
              },
              namespace: spec.namespace,
              flow_id: spec.flow_id,
              revision: spec.revision,
              inputs,
            }),
          )
          .await?;
        None
      }
      Err(e) => Some(failed(start, ErrorKind::Subflow, ctx.redact(&e.to_string()))),
    };

    ctx.close();
    Ok(outcome)
  }

  /// Publish heartbeats and extend the claim until dropped.
  async fn heartbeat(&self, start: &TaskRunStart) {
    let key = start.attempt_key();
    let ttl = Duration::from_millis(self.config.lease_ttl_ms);
    let mut ticker =
      tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms.max(1)));
    ticker.tick().await;

    loop {
      ticker.tick().await;
      if let Err(e) = self.leases.acquire(&key, self.id(), ttl).await {
        warn!(error = %e, "failed to extend attempt claim");
      }
      let beat = Message::TaskRunHeartbeat(TaskRunHeartbeat {
        execution_id: start.execution_id.clone(),
        task_id: start.task_id.clone(),
        iteration: start.iteration,
        attempt: start.attempt,
        worker_id: self.config.worker_id.clone(),
      });
      if let Err(e) = self.queue.publish(Topic::Executor, beat).await {
        warn!(error = %e, "failed to publish heartbeat");
      }
    }
  }
}

fn subflow_inputs(inputs: Value) -> Result<Map<String, Value>, TaskError> {
  match inputs {
    Value::Object(map) => Ok(map),
    Value::Null => Ok(Map::new()),
    other => Err(TaskError::property(
      "inputs",
      format!("expected an object, got {other}"),
    )),
  }
}

fn ended(
  start: &TaskRunStart,
  state: TaskRunState,
  output: Output,
  error: Option<TaskRunError>,
) -> TaskRunEnded {
  let outputs = state.is_successful().then_some(output.values);
  TaskRunEnded {
    execution_id: start.execution_id.clone(),
    task_id: start.task_id.clone(),
    iteration: start.iteration,
    attempt: start.attempt,
    state,
    outputs,
    warnings: output.warnings,
    error,
    worker_id: None,
  }
}

fn failed(start: &TaskRunStart, kind: ErrorKind, message: impl Into<String>) -> TaskRunEnded {
  ended(
    start,
    TaskRunState::Failed,
    Output::empty(),
    Some(TaskRunError::new(kind, message)),
  )
}
