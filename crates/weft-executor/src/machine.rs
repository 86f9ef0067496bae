use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};
use weft_flow::{Decision, Expressions, Flow, task_run_variables};
use weft_queue::{
  CancelTaskRun, DeadLetter, ExecutionEvent, KillRequest, Message, TaskRunEnded,
  TaskRunHeartbeat, TaskRunStart, TaskRunStarted, Topic,
};
use weft_store::{
  Branch, ErrorKind, Execution, ExecutionState, FlowRef, OutboxEntry, ParentRef, TaskRun,
  TaskRunError, TaskRunState, TriggerKind, TriggeringContext,
};

use crate::error::ExecutorError;

/// Worker id recorded on runs that are driven by a child execution.
const SUBFLOW_WORKER: &str = "subflow";

/// Time limits checked by [`Machine::scan`].
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
  pub heartbeat_grace: TimeDelta,
  pub start_timeout: TimeDelta,
  pub kill_grace: TimeDelta,
}

impl ScanLimits {
  pub fn from_millis(heartbeat_grace: u64, start_timeout: u64, kill_grace: u64) -> Self {
    let delta = |ms: u64| TimeDelta::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX));
    Self {
      heartbeat_grace: delta(heartbeat_grace),
      start_timeout: delta(start_timeout),
      kill_grace: delta(kill_grace),
    }
  }
}

/// Terminal report for the current attempt of a run.
#[derive(Debug, Clone)]
struct Outcome {
  state: TaskRunState,
  outputs: Option<Map<String, Value>>,
  warnings: Vec<String>,
  error: Option<TaskRunError>,
}

impl Outcome {
  fn failed(error: TaskRunError) -> Self {
    Self {
      state: TaskRunState::Failed,
      outputs: None,
      warnings: Vec::new(),
      error: Some(error),
    }
  }
}

/// Execution state transitions for one flow revision.
///
/// Every method mutates the execution in place and queues the messages it
/// produces on [`Execution::outbox`]; nothing here performs I/O. Methods
/// return whether the execution changed and must be saved.
pub struct Machine<'a> {
  flow: &'a Flow,
  expressions: &'a Expressions,
  now: DateTime<Utc>,
}

impl<'a> Machine<'a> {
  pub fn new(flow: &'a Flow, expressions: &'a Expressions, now: DateTime<Utc>) -> Self {
    Self {
      flow,
      expressions,
      now,
    }
  }

  /// CREATED -> RUNNING, then request the root tasks.
  pub fn start(&self, execution: &mut Execution) -> Result<bool, ExecutorError> {
    if execution.state != ExecutionState::Created {
      return Ok(false);
    }
    transition(execution, ExecutionState::Running, self.now)?;
    info!(
      execution_id = %execution.id,
      flow = %execution.flow,
      "execution started"
    );
    self.advance(execution)?;
    Ok(true)
  }

  pub fn task_run_started(
    &self,
    execution: &mut Execution,
    started: &TaskRunStarted,
  ) -> Result<bool, ExecutorError> {
    let Some(run) = execution.run_mut(&started.task_id, started.iteration) else {
      return Ok(false);
    };
    if run.attempt != started.attempt {
      return Ok(false);
    }
    // The run was killed before the worker picked it up.
    if run.state == TaskRunState::Killed {
      push(
        execution,
        Topic::WorkerControl,
        Message::CancelTaskRun(CancelTaskRun {
          execution_id: started.execution_id.clone(),
          task_id: started.task_id.clone(),
          iteration: started.iteration,
          attempt: started.attempt,
        }),
        Duration::ZERO,
      )?;
      return Ok(true);
    }
    Ok(run.mark_running(&started.worker_id, self.now))
  }

  pub fn heartbeat(
    &self,
    execution: &mut Execution,
    beat: &TaskRunHeartbeat,
  ) -> Result<bool, ExecutorError> {
    let Some(run) = execution.run_mut(&beat.task_id, beat.iteration) else {
      return Ok(false);
    };
    if run.attempt != beat.attempt {
      return Ok(false);
    }
    match run.state {
      TaskRunState::Running => {
        run.last_heartbeat_at = Some(self.now);
        Ok(true)
      }
      // The started report was lost or overtaken.
      TaskRunState::Created => Ok(run.mark_running(&beat.worker_id, self.now)),
      _ => Ok(false),
    }
  }

  /// Apply a worker's (or a child execution's) report for an attempt.
  ///
  /// Reports for older attempts and repeated reports are ignored.
  pub fn task_run_ended(
    &self,
    execution: &mut Execution,
    ended: &TaskRunEnded,
  ) -> Result<bool, ExecutorError> {
    if execution.is_terminal() {
      return Ok(false);
    }
    let Some(run) = execution.run(&ended.task_id, ended.iteration) else {
      return Ok(false);
    };
    if run.attempt != ended.attempt || run.is_terminal() || !ended.state.is_terminal() {
      debug!(
        execution_id = %execution.id,
        task_id = %ended.task_id,
        attempt = ended.attempt,
        "ignoring stale task run report"
      );
      return Ok(false);
    }

    self.complete_run(
      execution,
      &ended.task_id,
      ended.iteration,
      Outcome {
        state: ended.state,
        outputs: ended.outputs.clone(),
        warnings: ended.warnings.clone(),
        error: ended.error.clone(),
      },
    )?;
    self.advance(execution)?;
    Ok(true)
  }

  /// Stop the execution: RUNNING | PAUSED -> KILLING -> KILLED.
  pub fn kill(&self, execution: &mut Execution) -> Result<bool, ExecutorError> {
    match execution.state {
      ExecutionState::Created => {
        transition(execution, ExecutionState::Killed, self.now)?;
        notify_parent(execution)?;
        Ok(true)
      }
      ExecutionState::Running | ExecutionState::Paused => {
        execution.kill_requested_at = Some(self.now);
        transition(execution, ExecutionState::Killing, self.now)?;
        info!(execution_id = %execution.id, "execution kill requested");

        let cancelled = TaskRunError::new(ErrorKind::Cancelled, "execution killed");
        let mut messages = Vec::new();
        for run in execution.task_runs.iter_mut().filter(|r| !r.is_terminal()) {
          if run.state == TaskRunState::Created {
            run.finish(TaskRunState::Killed, None, Some(cancelled.clone()), self.now);
          } else {
            run.cancel_requested = true;
          }
          messages.push((
            Topic::WorkerControl,
            Message::CancelTaskRun(CancelTaskRun {
              execution_id: execution.id.clone(),
              task_id: run.task_id.clone(),
              iteration: run.iteration,
              attempt: run.attempt,
            }),
          ));
          if let Some(child) = &run.subflow_execution_id {
            messages.push((
              Topic::Executor,
              Message::KillRequest(KillRequest {
                execution_id: child.clone(),
              }),
            ));
          }
        }
        for (topic, message) in messages {
          push(execution, topic, message, Duration::ZERO)?;
        }

        self.finish_kill(execution)?;
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  pub fn pause(&self, execution: &mut Execution) -> Result<bool, ExecutorError> {
    if execution.state != ExecutionState::Running {
      return Ok(false);
    }
    transition(execution, ExecutionState::Paused, self.now)?;
    info!(execution_id = %execution.id, "execution paused");
    Ok(true)
  }

  pub fn resume(&self, execution: &mut Execution) -> Result<bool, ExecutorError> {
    if execution.state != ExecutionState::Paused {
      return Ok(false);
    }
    transition(execution, ExecutionState::Running, self.now)?;
    info!(execution_id = %execution.id, "execution resumed");

    let held: Vec<TaskRun> = execution
      .task_runs
      .iter_mut()
      .filter(|r| r.start_held && r.state == TaskRunState::Created)
      .map(|r| {
        r.start_held = false;
        r.requested_at = self.now;
        r.clone()
      })
      .collect();
    for run in held {
      let delay = run
        .retry_at
        .and_then(|at| (at - self.now).to_std().ok())
        .unwrap_or(Duration::ZERO);
      self.request_attempt(execution, &run, delay)?;
    }
    self.advance(execution)?;
    Ok(true)
  }

  /// Record the child execution requested by a flowable run and ask for it
  /// to be created. `child_flow` is the resolved revision, or why it could
  /// not be resolved.
  pub fn subflow_requested(
    &self,
    execution: &mut Execution,
    parent: &ParentRef,
    child_id: &str,
    child_flow: Result<FlowRef, String>,
    inputs: Map<String, Value>,
  ) -> Result<bool, ExecutorError> {
    if execution.is_terminal() {
      return Ok(false);
    }
    let killing = execution.state == ExecutionState::Killing;
    let Some(run) = execution.run_mut(&parent.task_id, parent.iteration) else {
      return Ok(false);
    };
    if run.attempt != parent.attempt || run.is_terminal() || run.subflow_execution_id.is_some() {
      return Ok(false);
    }

    // The kill overtook the request: the child is never created.
    if killing || run.cancel_requested {
      info!(
        execution_id = %execution.id,
        task_id = %parent.task_id,
        child_execution_id = %child_id,
        "subflow dropped, execution is being killed"
      );
      self.complete_run(
        execution,
        &parent.task_id,
        parent.iteration,
        Outcome {
          state: TaskRunState::Killed,
          outputs: None,
          warnings: Vec::new(),
          error: Some(TaskRunError::new(ErrorKind::Cancelled, "execution killed")),
        },
      )?;
      self.advance(execution)?;
      return Ok(true);
    }

    let flow = match child_flow {
      Ok(flow) => flow,
      Err(message) => {
        warn!(
          execution_id = %execution.id,
          task_id = %parent.task_id,
          error = %message,
          "subflow could not be resolved"
        );
        self.complete_run(
          execution,
          &parent.task_id,
          parent.iteration,
          Outcome::failed(TaskRunError::new(ErrorKind::Subflow, message)),
        )?;
        self.advance(execution)?;
        return Ok(true);
      }
    };

    run.subflow_execution_id = Some(child_id.to_string());
    if run.state == TaskRunState::Created {
      run.mark_running(SUBFLOW_WORKER, self.now);
    }
    info!(
      execution_id = %execution.id,
      task_id = %parent.task_id,
      child_execution_id = %child_id,
      child_flow = %flow,
      "subflow requested"
    );

    let trigger = TriggeringContext {
      kind: TriggerKind::Subflow,
      trigger_id: Some(parent.task_id.clone()),
      fire_key: None,
      payload: json!({
        "executionId": execution.id,
        "taskId": parent.task_id,
        "iteration": parent.iteration,
      }),
    };
    push(
      execution,
      Topic::Executor,
      Message::ExecutionEvent(ExecutionEvent {
        execution_id: child_id.to_string(),
        flow,
        state: ExecutionState::Created,
        trigger,
        inputs,
        parent: Some(parent.clone()),
      }),
      Duration::ZERO,
    )?;
    Ok(true)
  }

  /// Fail the execution whose message could not be delivered.
  pub fn dead_letter(
    &self,
    execution: &mut Execution,
    letter: &DeadLetter,
  ) -> Result<bool, ExecutorError> {
    if execution.is_terminal() {
      return Ok(false);
    }
    let diagnostic = TaskRunError::new(
      ErrorKind::Delivery,
      format!(
        "{} message on '{}' was dead-lettered after {} deliveries",
        letter.message.kind(),
        letter.topic,
        letter.deliveries
      ),
    );
    error!(
      execution_id = %execution.id,
      error = %diagnostic,
      "execution failed by undeliverable message"
    );

    let mut cancels = Vec::new();
    for run in execution.task_runs.iter_mut().filter(|r| !r.is_terminal()) {
      cancels.push(CancelTaskRun {
        execution_id: execution.id.clone(),
        task_id: run.task_id.clone(),
        iteration: run.iteration,
        attempt: run.attempt,
      });
      run.finish(TaskRunState::Failed, None, Some(diagnostic.clone()), self.now);
    }
    for cancel in cancels {
      push(
        execution,
        Topic::WorkerControl,
        Message::CancelTaskRun(cancel),
        Duration::ZERO,
      )?;
    }

    execution.error = Some(diagnostic);
    let to = match execution.state {
      ExecutionState::Killing => ExecutionState::Killed,
      _ => ExecutionState::Failed,
    };
    transition(execution, to, self.now)?;
    notify_parent(execution)?;
    Ok(true)
  }

  /// Enforce heartbeat, start and kill deadlines.
  pub fn scan(&self, execution: &mut Execution, limits: &ScanLimits) -> Result<bool, ExecutorError> {
    if kill_overdue(execution, limits, self.now) {
      self.force_kill(execution)?;
      return Ok(true);
    }

    let orphans = orphaned_runs(execution, limits, self.now);
    let unstarted = unstarted_runs(execution, limits, self.now);
    if orphans.is_empty() && unstarted.is_empty() {
      return Ok(false);
    }

    for (task_id, iteration) in orphans {
      let Some(run) = execution.run(&task_id, iteration) else {
        continue;
      };
      let worker = run.worker_id.clone().unwrap_or_default();
      let attempt = run.attempt;
      warn!(
        execution_id = %execution.id,
        task_id = %task_id,
        attempt,
        worker_id = %worker,
        "task run orphaned"
      );
      push(
        execution,
        Topic::WorkerControl,
        Message::CancelTaskRun(CancelTaskRun {
          execution_id: execution.id.clone(),
          task_id: task_id.clone(),
          iteration,
          attempt,
        }),
        Duration::ZERO,
      )?;
      let error = TaskRunError::new(
        ErrorKind::Orphaned,
        format!("worker '{worker}' stopped heartbeating"),
      );
      self.complete_run(execution, &task_id, iteration, Outcome::failed(error))?;
    }

    for (task_id, iteration) in unstarted {
      let Some(run) = execution.run_mut(&task_id, iteration) else {
        continue;
      };
      run.requested_at = self.now;
      run.retry_at = None;
      let run = run.clone();
      warn!(
        execution_id = %execution.id,
        task_id = %task_id,
        attempt = run.attempt,
        "task run start requeued"
      );
      self.request_attempt(execution, &run, Duration::ZERO)?;
    }

    self.advance(execution)?;
    Ok(true)
  }

  /// Request every task that became eligible, repeating until nothing
  /// changes, and finalize the execution once nothing is outstanding.
  fn advance(&self, execution: &mut Execution) -> Result<(), ExecutorError> {
    match execution.state {
      ExecutionState::Running => {}
      ExecutionState::Killing => return self.finish_kill(execution),
      _ => return Ok(()),
    }

    loop {
      let decisions = self.flow.next_eligible(execution, self.expressions);
      if decisions.is_empty() {
        break;
      }
      for decision in decisions {
        self.apply(execution, decision)?;
      }
    }

    if execution.outstanding_runs().next().is_none() {
      self.finalize(execution)?;
    }
    Ok(())
  }

  fn apply(&self, execution: &mut Execution, decision: Decision) -> Result<(), ExecutorError> {
    match decision {
      Decision::Run {
        task_id,
        branch,
        items: None,
      } => self.request_run(execution, &task_id, branch, 0, None),
      Decision::Run {
        task_id,
        branch,
        items: Some(items),
      } => {
        debug!(
          execution_id = %execution.id,
          task_id = %task_id,
          iterations = items.len(),
          "task expanded"
        );
        for (index, item) in items.into_iter().enumerate() {
          let iteration = u32::try_from(index).unwrap_or(u32::MAX);
          self.request_run(execution, &task_id, branch, iteration, Some(item))?;
        }
        Ok(())
      }
      Decision::Skip {
        task_id,
        branch,
        reason,
      } => {
        debug!(execution_id = %execution.id, task_id = %task_id, ?reason, "task skipped");
        let run = TaskRun::skipped(&execution.id, task_id, 0, branch, reason, self.now);
        execution.task_runs.push(run);
        Ok(())
      }
      Decision::Fail {
        task_id,
        branch,
        message,
      } => {
        warn!(execution_id = %execution.id, task_id = %task_id, error = %message, "task could not start");
        let mut run = TaskRun::new(&execution.id, task_id, 0, branch, self.now);
        run.finish(
          TaskRunState::Failed,
          None,
          Some(TaskRunError::new(ErrorKind::Task, message)),
          self.now,
        );
        execution.task_runs.push(run);
        Ok(())
      }
    }
  }

  fn request_run(
    &self,
    execution: &mut Execution,
    task_id: &str,
    branch: Branch,
    iteration: u32,
    value: Option<Value>,
  ) -> Result<(), ExecutorError> {
    let mut run = TaskRun::new(&execution.id, task_id, iteration, branch, self.now);
    run.value = value;
    run.resolved_config = self.flow.task(task_id).map(|t| t.config.clone());
    self.request_attempt(execution, &run, Duration::ZERO)?;
    execution.task_runs.push(run);
    Ok(())
  }

  /// Queue a `TaskRunStart` for the current attempt of `run`.
  fn request_attempt(
    &self,
    execution: &mut Execution,
    run: &TaskRun,
    delay: Duration,
  ) -> Result<(), ExecutorError> {
    let task = self
      .flow
      .task(&run.task_id)
      .ok_or_else(|| ExecutorError::UnknownTask {
        flow: execution.flow.to_string(),
        task_id: run.task_id.clone(),
      })?;

    let start = TaskRunStart {
      execution_id: execution.id.clone(),
      flow: execution.flow.clone(),
      task_id: run.task_id.clone(),
      task_type: task.type_name.clone(),
      iteration: run.iteration,
      attempt: run.attempt,
      resolved_config: run
        .resolved_config
        .clone()
        .unwrap_or_else(|| task.config.clone()),
      variables: task_run_variables(self.flow, execution, run),
      timeout_ms: task
        .timeout
        .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
    };
    push(execution, Topic::WorkerJobs, Message::TaskRunStart(start), delay)
  }

  /// Record an outcome, scheduling another attempt when the retry policy
  /// allows it.
  fn complete_run(
    &self,
    execution: &mut Execution,
    task_id: &str,
    iteration: u32,
    outcome: Outcome,
  ) -> Result<(), ExecutorError> {
    let policy = self.flow.task(task_id).and_then(|t| t.retry.clone());
    let killing = execution.state == ExecutionState::Killing;
    let paused = execution.state == ExecutionState::Paused;
    let Some(run) = execution.run_mut(task_id, iteration) else {
      return Ok(());
    };

    let retry = policy.filter(|p| {
      outcome.state == TaskRunState::Failed
        && !killing
        && !run.cancel_requested
        && p.should_retry(run.attempt)
    });
    if let Some(policy) = retry {
      let delay = policy.delay_for(run.attempt);
      let error = outcome
        .error
        .unwrap_or_else(|| TaskRunError::new(ErrorKind::Task, "task run failed"));
      let retry_at = TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| self.now.checked_add_signed(d))
        .unwrap_or(self.now);
      run.schedule_retry(error, retry_at, self.now);
      info!(
        task_id = %task_id,
        iteration,
        attempt = run.attempt,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        "task run retry scheduled"
      );
      // Started again by `resume`.
      if paused {
        run.start_held = true;
        return Ok(());
      }
      let run = run.clone();
      return self.request_attempt(execution, &run, delay);
    }

    // A run that reports success after the kill was requested is still killed.
    let (state, outputs) = if killing && run.cancel_requested && outcome.state.is_successful() {
      (TaskRunState::Killed, None)
    } else {
      (outcome.state, outcome.outputs)
    };
    run.warnings = outcome.warnings;
    if run.finish(state, outputs, outcome.error, self.now) {
      match state {
        TaskRunState::Success | TaskRunState::Warning => {
          debug!(task_id = %task_id, iteration, %state, "task run ended");
        }
        _ => warn!(task_id = %task_id, iteration, %state, "task run ended"),
      }
    }
    Ok(())
  }

  /// Mark whatever is still outstanding as KILLED.
  fn force_kill(&self, execution: &mut Execution) -> Result<(), ExecutorError> {
    let error = TaskRunError::new(ErrorKind::Cancelled, "kill grace period elapsed");
    for run in execution.task_runs.iter_mut().filter(|r| !r.is_terminal()) {
      warn!(execution_id = %execution.id, task_id = %run.task_id, "task run force killed");
      run.finish(TaskRunState::Killed, None, Some(error.clone()), self.now);
    }
    self.finish_kill(execution)
  }

  fn finish_kill(&self, execution: &mut Execution) -> Result<(), ExecutorError> {
    if execution.state != ExecutionState::Killing || execution.outstanding_runs().next().is_some() {
      return Ok(());
    }
    execution.outputs = self.collect_outputs(execution);
    transition(execution, ExecutionState::Killed, self.now)?;
    info!(execution_id = %execution.id, "execution killed");
    notify_parent(execution)
  }

  /// Fold task states into the final execution state.
  ///
  /// FAILED wins over WARNING over SUCCESS. Skipped tasks and listeners do
  /// not count, and a failure of an `allowFailure` task counts as WARNING.
  fn finalize(&self, execution: &mut Execution) -> Result<(), ExecutorError> {
    let mut state = ExecutionState::Success;
    for task in self.flow.tasks.iter().chain(&self.flow.errors) {
      let contribution = match execution.task_state(&task.id) {
        Some(TaskRunState::Failed | TaskRunState::Killed) if task.allow_failure => {
          ExecutionState::Warning
        }
        Some(TaskRunState::Failed | TaskRunState::Killed) => ExecutionState::Failed,
        Some(TaskRunState::Warning) => ExecutionState::Warning,
        _ => continue,
      };
      if contribution == ExecutionState::Failed || state == ExecutionState::Success {
        state = contribution;
      }
    }

    execution.outputs = self.collect_outputs(execution);
    transition(execution, state, self.now)?;
    info!(
      execution_id = %execution.id,
      flow = %execution.flow,
      %state,
      "execution ended"
    );
    notify_parent(execution)
  }

  fn collect_outputs(&self, execution: &Execution) -> Map<String, Value> {
    self
      .flow
      .task_ids()
      .filter(|id| execution.task_state(id).is_some_and(TaskRunState::is_successful))
      .filter_map(|id| Some((id.to_string(), execution.task_outputs(id)?)))
      .collect()
  }
}

/// Whether [`Machine::scan`] has anything to do for `execution`.
pub fn needs_scan(execution: &Execution, limits: &ScanLimits, now: DateTime<Utc>) -> bool {
  kill_overdue(execution, limits, now)
    || !orphaned_runs(execution, limits, now).is_empty()
    || !unstarted_runs(execution, limits, now).is_empty()
}

/// Move an execution that cannot run at all straight to FAILED.
pub fn reject(
  execution: &mut Execution,
  error: TaskRunError,
  now: DateTime<Utc>,
) -> Result<(), ExecutorError> {
  warn!(execution_id = %execution.id, flow = %execution.flow, error = %error, "execution rejected");
  execution.error = Some(error);
  transition(execution, ExecutionState::Failed, now)?;
  notify_parent(execution)
}

fn kill_overdue(execution: &Execution, limits: &ScanLimits, now: DateTime<Utc>) -> bool {
  execution.state == ExecutionState::Killing
    && execution
      .kill_requested_at
      .is_some_and(|at| now - at >= limits.kill_grace)
}

/// Running runs whose worker stopped heartbeating. Runs waiting on a child
/// execution do not heartbeat and are excluded.
fn orphaned_runs(execution: &Execution, limits: &ScanLimits, now: DateTime<Utc>) -> Vec<(String, u32)> {
  if !matches!(
    execution.state,
    ExecutionState::Running | ExecutionState::Paused
  ) {
    return Vec::new();
  }
  execution
    .task_runs
    .iter()
    .filter(|r| r.state == TaskRunState::Running && r.subflow_execution_id.is_none())
    .filter(|r| {
      let last = r.last_heartbeat_at.or(r.started_at).unwrap_or(r.requested_at);
      now - last > limits.heartbeat_grace
    })
    .map(|r| (r.task_id.clone(), r.iteration))
    .collect()
}

/// Requested attempts no worker reported starting in time.
fn unstarted_runs(execution: &Execution, limits: &ScanLimits, now: DateTime<Utc>) -> Vec<(String, u32)> {
  if execution.state != ExecutionState::Running {
    return Vec::new();
  }
  execution
    .task_runs
    .iter()
    .filter(|r| r.state == TaskRunState::Created)
    .filter(|r| now - r.retry_at.unwrap_or(r.requested_at) > limits.start_timeout)
    .map(|r| (r.task_id.clone(), r.iteration))
    .collect()
}

/// Change state and announce it on [`Topic::ExecutionUpdates`].
fn transition(
  execution: &mut Execution,
  to: ExecutionState,
  now: DateTime<Utc>,
) -> Result<(), ExecutorError> {
  execution.transition(to, now)?;
  let event = ExecutionEvent {
    execution_id: execution.id.clone(),
    flow: execution.flow.clone(),
    state: to,
    trigger: execution.trigger.clone(),
    inputs: execution.inputs.clone(),
    parent: execution.parent.clone(),
  };
  push(
    execution,
    Topic::ExecutionUpdates,
    Message::ExecutionEvent(event),
    Duration::ZERO,
  )
}

/// Report a finished child execution to the task run that spawned it.
fn notify_parent(execution: &mut Execution) -> Result<(), ExecutorError> {
  let Some(parent) = execution.parent.clone() else {
    return Ok(());
  };
  let state = match execution.state {
    ExecutionState::Success => TaskRunState::Success,
    ExecutionState::Warning => TaskRunState::Warning,
    ExecutionState::Killed => TaskRunState::Killed,
    _ => TaskRunState::Failed,
  };
  let error = (!state.is_successful()).then(|| {
    TaskRunError::new(
      ErrorKind::Subflow,
      format!("subflow execution '{}' ended {}", execution.id, execution.state),
    )
  });
  let ended = TaskRunEnded {
    execution_id: parent.execution_id,
    task_id: parent.task_id,
    iteration: parent.iteration,
    attempt: parent.attempt,
    state,
    outputs: state.is_successful().then(|| execution.outputs.clone()),
    warnings: Vec::new(),
    error,
    worker_id: None,
  };
  push(
    execution,
    Topic::Executor,
    Message::TaskRunEnded(ended),
    Duration::ZERO,
  )
}

fn push(
  execution: &mut Execution,
  topic: Topic,
  message: Message,
  delay: Duration,
) -> Result<(), ExecutorError> {
  execution.outbox.push(OutboxEntry {
    topic: topic.as_str().to_string(),
    message: serde_json::to_value(&message)?,
    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
  });
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::load;
  use weft_store::SkipReason;

  fn execution(flow: &Flow) -> Execution {
    Execution::new(
      "e1",
      flow.reference(),
      TriggeringContext::manual(),
      Map::new(),
      None,
      Utc::now(),
    )
  }

  fn drain(execution: &mut Execution) -> Vec<(Topic, Message)> {
    execution
      .outbox
      .drain(..)
      .map(|e| {
        (
          e.topic.parse().unwrap(),
          serde_json::from_value(e.message).unwrap(),
        )
      })
      .collect()
  }

  fn starts(messages: &[(Topic, Message)]) -> Vec<TaskRunStart> {
    messages
      .iter()
      .filter_map(|(_, m)| match m {
        Message::TaskRunStart(s) => Some(s.clone()),
        _ => None,
      })
      .collect()
  }

  fn ended(start: &TaskRunStart, state: TaskRunState) -> TaskRunEnded {
    TaskRunEnded {
      execution_id: start.execution_id.clone(),
      task_id: start.task_id.clone(),
      iteration: start.iteration,
      attempt: start.attempt,
      state,
      outputs: Some(Map::from_iter([("n".to_string(), json!(start.iteration))])),
      warnings: Vec::new(),
      error: (state == TaskRunState::Failed).then(|| TaskRunError::new(ErrorKind::Task, "boom")),
      worker_id: Some("w1".to_string()),
    }
  }

  const LINEAR: &str = r#"
id: linear
namespace: test
tasks:
  - id: a
    type: test.Noop
  - id: b
    type: test.Noop
"#;

  #[test]
  fn test_start_requests_roots_only() {
    let flow = load(LINEAR);
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);

    assert!(machine.start(&mut ex).unwrap());
    assert_eq!(ex.state, ExecutionState::Running);

    let messages = drain(&mut ex);
    let starts = starts(&messages);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].task_id, "a");
    assert_eq!(starts[0].attempt, 1);
    assert!(messages.iter().any(|(topic, m)| *topic == Topic::ExecutionUpdates
      && matches!(m, Message::ExecutionEvent(e) if e.state == ExecutionState::Running)));

    assert!(!machine.start(&mut ex).unwrap());
  }

  #[test]
  fn test_linear_flow_succeeds_with_outputs() {
    let flow = load(LINEAR);
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();

    let a = starts(&drain(&mut ex)).remove(0);
    assert!(machine.task_run_ended(&mut ex, &ended(&a, TaskRunState::Success)).unwrap());
    let b = starts(&drain(&mut ex)).remove(0);
    assert_eq!(b.task_id, "b");
    machine.task_run_ended(&mut ex, &ended(&b, TaskRunState::Success)).unwrap();

    assert_eq!(ex.state, ExecutionState::Success);
    assert_eq!(ex.outputs["a"], json!({"n": 0}));
    assert!(ex.ended_at.is_some());
  }

  #[test]
  fn test_replayed_report_is_ignored() {
    let flow = load(LINEAR);
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();

    let a = starts(&drain(&mut ex)).remove(0);
    let report = ended(&a, TaskRunState::Success);
    assert!(machine.task_run_ended(&mut ex, &report).unwrap());
    let first = drain(&mut ex);
    let runs = ex.task_runs.clone();

    assert!(!machine.task_run_ended(&mut ex, &report).unwrap());
    assert!(ex.outbox.is_empty());
    assert_eq!(ex.task_runs, runs);
    assert_eq!(starts(&first).len(), 1);
  }

  #[test]
  fn test_retry_until_max_attempts() {
    let flow = load(
      r#"
id: retry
namespace: test
tasks:
  - id: a
    type: test.Noop
    retry:
      type: constant
      maxAttempts: 3
      interval: 1000
"#,
    );
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();

    let mut start = starts(&drain(&mut ex)).remove(0);
    for attempt in 1..=2 {
      assert_eq!(start.attempt, attempt);
      machine.task_run_ended(&mut ex, &ended(&start, TaskRunState::Failed)).unwrap();
      assert_eq!(ex.state, ExecutionState::Running);
      let entry = ex.outbox.iter().find(|e| e.topic == "worker_jobs").unwrap();
      assert_eq!(entry.delay_ms, 1000);
      start = starts(&drain(&mut ex)).remove(0);
    }
    assert_eq!(start.attempt, 3);
    machine.task_run_ended(&mut ex, &ended(&start, TaskRunState::Failed)).unwrap();

    assert_eq!(ex.state, ExecutionState::Failed);
    let run = ex.run("a", 0).unwrap();
    assert_eq!(run.attempts.len(), 3);
    assert!(run.attempts.iter().all(|a| a.state == TaskRunState::Failed));
  }

  #[test]
  fn test_stale_attempt_report_is_ignored() {
    let flow = load(
      "id: f\nnamespace: test\ntasks:\n  - id: a\n    type: test.Noop\n    retry:\n      maxAttempts: 2\n",
    );
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();

    let first = starts(&drain(&mut ex)).remove(0);
    machine.task_run_ended(&mut ex, &ended(&first, TaskRunState::Failed)).unwrap();
    drain(&mut ex);

    assert!(!machine.task_run_ended(&mut ex, &ended(&first, TaskRunState::Success)).unwrap());
    assert_eq!(ex.run("a", 0).unwrap().attempt, 2);
    assert_eq!(ex.run("a", 0).unwrap().state, TaskRunState::Created);
  }

  #[test]
  fn test_allow_failure_yields_warning() {
    let flow = load(
      r#"
id: tolerant
namespace: test
tasks:
  - id: a
    type: test.Noop
    allowFailure: true
  - id: b
    type: test.Noop
errors:
  - id: handler
    type: test.Noop
"#,
    );
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();

    let a = starts(&drain(&mut ex)).remove(0);
    machine.task_run_ended(&mut ex, &ended(&a, TaskRunState::Failed)).unwrap();

    assert_eq!(ex.task_state("b"), Some(TaskRunState::Skipped));
    assert_eq!(ex.skip_reason("b"), Some(SkipReason::UpstreamFailed));
    let handler = starts(&drain(&mut ex)).remove(0);
    assert_eq!(handler.task_id, "handler");
    machine.task_run_ended(&mut ex, &ended(&handler, TaskRunState::Success)).unwrap();

    assert_eq!(ex.state, ExecutionState::Warning);
  }

  #[test]
  fn test_for_each_expands_iterations() {
    let flow = load(
      r#"
id: fanout
namespace: test
tasks:
  - id: each
    type: test.Noop
    forEach: "[1, 2, 3]"
  - id: after
    type: test.Noop
"#,
    );
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();

    let items = starts(&drain(&mut ex));
    assert_eq!(items.len(), 3);
    assert_eq!(items[2].variables["taskrun"]["value"], json!(3));

    for start in items.iter().rev() {
      machine.task_run_ended(&mut ex, &ended(start, TaskRunState::Success)).unwrap();
    }
    let after = starts(&drain(&mut ex));
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].task_id, "after");
    assert_eq!(
      ex.task_outputs("each"),
      Some(json!([{"n": 0}, {"n": 1}, {"n": 2}]))
    );
  }

  #[test]
  fn test_kill_cancels_running_runs() {
    let flow = load(LINEAR);
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();
    let a = starts(&drain(&mut ex)).remove(0);
    machine
      .task_run_started(
        &mut ex,
        &TaskRunStarted {
          execution_id: a.execution_id.clone(),
          task_id: a.task_id.clone(),
          iteration: 0,
          attempt: 1,
          worker_id: "w1".to_string(),
        },
      )
      .unwrap();

    assert!(machine.kill(&mut ex).unwrap());
    assert_eq!(ex.state, ExecutionState::Killing);
    let messages = drain(&mut ex);
    assert!(messages.iter().any(|(topic, m)| *topic == Topic::WorkerControl
      && matches!(m, Message::CancelTaskRun(c) if c.task_id == "a")));

    // A success reported after cancellation does not count.
    machine.task_run_ended(&mut ex, &ended(&a, TaskRunState::Success)).unwrap();
    assert_eq!(ex.state, ExecutionState::Killed);
    assert_eq!(ex.run("a", 0).unwrap().state, TaskRunState::Killed);
    assert!(!ex.has_runs("b"));
  }

  #[test]
  fn test_kill_grace_forces_killed() {
    let flow = load(LINEAR);
    let expressions = Expressions::new();
    let now = Utc::now();
    let mut ex = execution(&flow);
    let machine = Machine::new(&flow, &expressions, now);
    machine.start(&mut ex).unwrap();
    let a = starts(&drain(&mut ex)).remove(0);
    ex.run_mut(&a.task_id, 0).unwrap().mark_running("w1", now);
    machine.kill(&mut ex).unwrap();
    drain(&mut ex);

    let limits = ScanLimits::from_millis(60_000, 60_000, 30_000);
    let later = now + TimeDelta::seconds(31);
    assert!(needs_scan(&ex, &limits, later));
    Machine::new(&flow, &expressions, later).scan(&mut ex, &limits).unwrap();

    assert_eq!(ex.state, ExecutionState::Killed);
    assert_eq!(ex.run("a", 0).unwrap().state, TaskRunState::Killed);
  }

  #[test]
  fn test_orphaned_run_fails() {
    let flow = load(LINEAR);
    let expressions = Expressions::new();
    let now = Utc::now();
    let mut ex = execution(&flow);
    Machine::new(&flow, &expressions, now).start(&mut ex).unwrap();
    drain(&mut ex);
    ex.run_mut("a", 0).unwrap().mark_running("w1", now);

    let limits = ScanLimits::from_millis(30_000, 300_000, 30_000);
    assert!(!needs_scan(&ex, &limits, now + TimeDelta::seconds(10)));
    let later = now + TimeDelta::seconds(31);
    assert!(Machine::new(&flow, &expressions, later).scan(&mut ex, &limits).unwrap());

    let run = ex.run("a", 0).unwrap();
    assert_eq!(run.state, TaskRunState::Failed);
    assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::Orphaned);
    assert_eq!(ex.state, ExecutionState::Failed);
  }

  #[test]
  fn test_unstarted_run_is_requeued() {
    let flow = load(LINEAR);
    let expressions = Expressions::new();
    let now = Utc::now();
    let mut ex = execution(&flow);
    Machine::new(&flow, &expressions, now).start(&mut ex).unwrap();
    drain(&mut ex);

    let limits = ScanLimits::from_millis(30_000, 60_000, 30_000);
    let later = now + TimeDelta::seconds(61);
    Machine::new(&flow, &expressions, later).scan(&mut ex, &limits).unwrap();

    let again = starts(&drain(&mut ex));
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].attempt, 1);
    assert_eq!(ex.run("a", 0).unwrap().requested_at, later);
  }

  #[test]
  fn test_pause_holds_new_runs() {
    let flow = load(LINEAR);
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();
    let a = starts(&drain(&mut ex)).remove(0);

    assert!(machine.pause(&mut ex).unwrap());
    machine.task_run_ended(&mut ex, &ended(&a, TaskRunState::Success)).unwrap();
    assert!(starts(&drain(&mut ex)).is_empty());
    assert_eq!(ex.state, ExecutionState::Paused);

    assert!(machine.resume(&mut ex).unwrap());
    let b = starts(&drain(&mut ex));
    assert_eq!(b[0].task_id, "b");
  }

  #[test]
  fn test_dead_letter_fails_execution() {
    let flow = load(LINEAR);
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();
    let a = starts(&drain(&mut ex)).remove(0);

    let letter = DeadLetter {
      topic: Topic::WorkerJobs,
      deliveries: 5,
      message: Box::new(Message::TaskRunStart(a)),
    };
    assert!(machine.dead_letter(&mut ex, &letter).unwrap());
    assert_eq!(ex.state, ExecutionState::Failed);
    assert_eq!(ex.error.as_ref().unwrap().kind, ErrorKind::Delivery);
    assert!(ex.task_runs.iter().all(|r| r.is_terminal()));
  }

  #[test]
  fn test_child_reports_to_parent() {
    let flow = load(LINEAR);
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let parent = ParentRef {
      execution_id: "p1".to_string(),
      task_id: "call".to_string(),
      iteration: 0,
      attempt: 2,
    };
    let mut child = Execution::new(
      "c1",
      flow.reference(),
      TriggeringContext::manual(),
      Map::new(),
      Some(parent),
      Utc::now(),
    );
    machine.start(&mut child).unwrap();
    for _ in 0..2 {
      let start = starts(&drain(&mut child)).remove(0);
      machine.task_run_ended(&mut child, &ended(&start, TaskRunState::Success)).unwrap();
    }

    let report = drain(&mut child)
      .into_iter()
      .find_map(|(topic, m)| match m {
        Message::TaskRunEnded(e) if topic == Topic::Executor => Some(e),
        _ => None,
      })
      .unwrap();
    assert_eq!(report.execution_id, "p1");
    assert_eq!(report.attempt, 2);
    assert_eq!(report.state, TaskRunState::Success);
    assert_eq!(report.outputs.unwrap()["b"], json!({"n": 0}));
  }

  #[test]
  fn test_subflow_request_is_recorded_once() {
    let flow = load("id: p\nnamespace: test\ntasks:\n  - id: call\n    type: test.Subflow\n");
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();
    let call = starts(&drain(&mut ex)).remove(0);
    let parent = ParentRef {
      execution_id: ex.id.clone(),
      task_id: call.task_id.clone(),
      iteration: 0,
      attempt: 1,
    };

    let child = FlowRef::new("test", "child", 1);
    assert!(machine.subflow_requested(&mut ex, &parent, "c1", Ok(child.clone()), Map::new()).unwrap());
    assert!(!machine.subflow_requested(&mut ex, &parent, "c1", Ok(child), Map::new()).unwrap());

    let events: Vec<_> = drain(&mut ex)
      .into_iter()
      .filter(|(topic, _)| *topic == Topic::Executor)
      .collect();
    assert_eq!(events.len(), 1);
    assert_eq!(ex.run("call", 0).unwrap().subflow_execution_id.as_deref(), Some("c1"));
  }

  const SUBFLOW: &str = "id: p\nnamespace: test\ntasks:\n  - id: call\n    type: test.Subflow\n";

  fn call_parent(ex: &Execution) -> ParentRef {
    ParentRef {
      execution_id: ex.id.clone(),
      task_id: "call".to_string(),
      iteration: 0,
      attempt: 1,
    }
  }

  #[test]
  fn test_kill_before_subflow_spawn_drops_child() {
    let flow = load(SUBFLOW);
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();
    let call = starts(&drain(&mut ex)).remove(0);
    machine
      .task_run_started(
        &mut ex,
        &TaskRunStarted {
          execution_id: call.execution_id.clone(),
          task_id: call.task_id.clone(),
          iteration: 0,
          attempt: 1,
          worker_id: "w1".to_string(),
        },
      )
      .unwrap();
    machine.kill(&mut ex).unwrap();
    drain(&mut ex);

    let parent = call_parent(&ex);
    let child = FlowRef::new("test", "child", 1);
    assert!(machine.subflow_requested(&mut ex, &parent, "c1", Ok(child), Map::new()).unwrap());

    let messages = drain(&mut ex);
    assert!(!messages.iter().any(|(topic, m)| *topic == Topic::Executor
      && matches!(m, Message::ExecutionEvent(e) if e.execution_id == "c1")));
    let run = ex.run("call", 0).unwrap();
    assert_eq!(run.state, TaskRunState::Killed);
    assert!(run.subflow_execution_id.is_none());
    assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(ex.state, ExecutionState::Killed);
  }

  #[test]
  fn test_kill_reaches_running_subflow() {
    let flow = load(SUBFLOW);
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();
    drain(&mut ex);
    let parent = call_parent(&ex);
    let child = FlowRef::new("test", "child", 1);
    machine.subflow_requested(&mut ex, &parent, "c1", Ok(child), Map::new()).unwrap();
    drain(&mut ex);

    assert!(machine.kill(&mut ex).unwrap());
    assert_eq!(ex.state, ExecutionState::Killing);
    let messages = drain(&mut ex);
    assert!(messages.iter().any(|(topic, m)| *topic == Topic::Executor
      && matches!(m, Message::KillRequest(k) if k.execution_id == "c1")));

    // The killed child reports back to the parent run.
    let report = TaskRunEnded {
      execution_id: ex.id.clone(),
      task_id: "call".to_string(),
      iteration: 0,
      attempt: 1,
      state: TaskRunState::Killed,
      outputs: None,
      warnings: Vec::new(),
      error: Some(TaskRunError::new(ErrorKind::Subflow, "subflow execution 'c1' ended KILLED")),
      worker_id: None,
    };
    assert!(machine.task_run_ended(&mut ex, &report).unwrap());
    assert_eq!(ex.run("call", 0).unwrap().state, TaskRunState::Killed);
    assert_eq!(ex.state, ExecutionState::Killed);
  }

  #[test]
  fn test_retry_while_paused_waits_for_resume() {
    let flow = load(
      r#"
id: held
namespace: test
tasks:
  - id: a
    type: test.Noop
    retry:
      type: constant
      maxAttempts: 2
      interval: 1000
"#,
    );
    let expressions = Expressions::new();
    let now = Utc::now();
    let machine = Machine::new(&flow, &expressions, now);
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();
    let a = starts(&drain(&mut ex)).remove(0);

    machine.pause(&mut ex).unwrap();
    machine.task_run_ended(&mut ex, &ended(&a, TaskRunState::Failed)).unwrap();
    assert!(starts(&drain(&mut ex)).is_empty());
    let run = ex.run("a", 0).unwrap();
    assert_eq!(run.attempt, 2);
    assert_eq!(run.state, TaskRunState::Created);
    assert!(run.start_held);

    // Resumed before the backoff elapsed: the remaining delay still applies.
    Machine::new(&flow, &expressions, now + TimeDelta::milliseconds(400))
      .resume(&mut ex)
      .unwrap();
    let entry = ex.outbox.iter().find(|e| e.topic == "worker_jobs").unwrap();
    assert_eq!(entry.delay_ms, 600);
    let again = starts(&drain(&mut ex));
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].attempt, 2);
    assert!(!ex.run("a", 0).unwrap().start_held);
  }

  #[test]
  fn test_condition_false_passes_through() {
    let flow = load(
      r#"
id: cond
namespace: test
tasks:
  - id: a
    type: test.Noop
    condition: "false"
  - id: b
    type: test.Noop
"#,
    );
    let expressions = Expressions::new();
    let machine = Machine::new(&flow, &expressions, Utc::now());
    let mut ex = execution(&flow);
    machine.start(&mut ex).unwrap();

    let first = starts(&drain(&mut ex));
    assert_eq!(first[0].task_id, "b");
    assert_eq!(ex.skip_reason("a"), Some(SkipReason::ConditionFalse));
  }
}
