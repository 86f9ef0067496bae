use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use weft_plugin::{CapabilityKind, Trigger, TriggerPolicy};
use weft_store::{Branch, Execution, FlowRef, SkipReason, TaskRunState};

use crate::context::execution_variables;
use crate::document::RetryPolicy;
use crate::expression::Expressions;
use crate::graph::Graph;

/// A resolved task.
#[derive(Debug, Clone)]
pub struct TaskNode {
  pub id: String,
  pub type_name: String,
  pub kind: CapabilityKind,
  pub branch: Branch,
  /// Type-specific configuration, still unrendered.
  pub config: serde_json::Value,
  pub retry: Option<RetryPolicy>,
  pub allow_failure: bool,
  pub timeout: Option<Duration>,
  pub condition: Option<String>,
  pub for_each: Option<String>,
}

/// A resolved trigger with its plugin instance.
#[derive(Clone)]
pub struct TriggerNode {
  pub id: String,
  pub type_name: String,
  pub config: serde_json::Value,
  pub plugin: Arc<dyn Trigger>,
  pub policy: TriggerPolicy,
  pub dedup_window: Option<Duration>,
  pub disabled: bool,
}

impl fmt::Debug for TriggerNode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TriggerNode")
      .field("id", &self.id)
      .field("type_name", &self.type_name)
      .field("policy", &self.policy)
      .field("dedup_window", &self.dedup_window)
      .field("disabled", &self.disabled)
      .finish()
  }
}

/// What should happen to a task that has no run yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
  /// Start the task; `items` holds the `forEach` values, one run each.
  Run {
    task_id: String,
    branch: Branch,
    items: Option<Vec<serde_json::Value>>,
  },
  Skip {
    task_id: String,
    branch: Branch,
    reason: SkipReason,
  },
  /// The task cannot start (its condition or `forEach` failed to evaluate).
  Fail {
    task_id: String,
    branch: Branch,
    message: String,
  },
}

impl Decision {
  pub fn task_id(&self) -> &str {
    match self {
      Decision::Run { task_id, .. }
      | Decision::Skip { task_id, .. }
      | Decision::Fail { task_id, .. } => task_id,
    }
  }
}

/// A validated flow revision. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Flow {
  pub namespace: String,
  pub id: String,
  pub revision: u32,
  pub description: Option<String>,
  pub inputs: serde_json::Map<String, serde_json::Value>,
  pub variables: serde_json::Map<String, serde_json::Value>,
  pub disabled: bool,
  pub tasks: Vec<TaskNode>,
  pub errors: Vec<TaskNode>,
  pub listeners: Vec<TaskNode>,
  pub triggers: Vec<TriggerNode>,
  pub(crate) main_graph: Graph,
  pub(crate) errors_graph: Graph,
  pub(crate) listeners_graph: Graph,
}

impl Flow {
  pub fn reference(&self) -> FlowRef {
    FlowRef::new(&self.namespace, &self.id, self.revision)
  }

  /// Look up a task in any branch.
  pub fn task(&self, task_id: &str) -> Option<&TaskNode> {
    self
      .tasks
      .iter()
      .chain(&self.errors)
      .chain(&self.listeners)
      .find(|t| t.id == task_id)
  }

  /// Ids of all tasks in every branch.
  pub fn task_ids(&self) -> impl Iterator<Item = &str> {
    self
      .tasks
      .iter()
      .chain(&self.errors)
      .chain(&self.listeners)
      .map(|t| t.id.as_str())
  }

  pub fn graph(&self, branch: Branch) -> &Graph {
    match branch {
      Branch::Main => &self.main_graph,
      Branch::Errors => &self.errors_graph,
      Branch::Listeners => &self.listeners_graph,
    }
  }

  /// Tasks of the main branch with no predecessors.
  pub fn root_tasks(&self) -> &[String] {
    self.main_graph.entry_points()
  }

  /// Decide which tasks without runs can now run or must be skipped.
  ///
  /// Only one branch is considered at a time: the error branch once the
  /// main branch is settled and one of its tasks FAILED, the listeners once
  /// both are settled. An empty result with no outstanding runs means the
  /// execution can be finalized.
  pub fn next_eligible(&self, execution: &Execution, expressions: &Expressions) -> Vec<Decision> {
    let vars = execution_variables(self, execution);

    let main = self.decide(Branch::Main, execution, expressions, &vars);
    if !main.is_empty() || execution.has_outstanding(Branch::Main) {
      return main;
    }

    let main_failed = self
      .tasks
      .iter()
      .any(|t| execution.task_state(&t.id) == Some(TaskRunState::Failed));
    if main_failed {
      let errors = self.decide(Branch::Errors, execution, expressions, &vars);
      if !errors.is_empty() || execution.has_outstanding(Branch::Errors) {
        return errors;
      }
    }

    self.decide(Branch::Listeners, execution, expressions, &vars)
  }

  fn decide(
    &self,
    branch: Branch,
    execution: &Execution,
    expressions: &Expressions,
    vars: &serde_json::Value,
  ) -> Vec<Decision> {
    let graph = self.graph(branch);
    let mut decisions = Vec::new();

    for task_id in graph.tasks() {
      if execution.has_runs(task_id) {
        continue;
      }
      let Some(task) = self.task(task_id) else {
        continue;
      };

      let mut blocked = false;
      let mut ready = true;
      for upstream in graph.upstream(task_id) {
        match execution.task_state(upstream) {
          Some(state) if state.is_terminal() => {
            blocked |= match state {
              TaskRunState::Success | TaskRunState::Warning => false,
              TaskRunState::Skipped => !execution
                .skip_reason(upstream)
                .is_some_and(SkipReason::passes_through),
              _ => true,
            };
          }
          _ => ready = false,
        }
      }
      if !ready {
        continue;
      }

      if blocked {
        decisions.push(Decision::Skip {
          task_id: task_id.clone(),
          branch,
          reason: SkipReason::UpstreamFailed,
        });
        continue;
      }

      decisions.push(self.decide_ready(task, branch, expressions, vars));
    }

    decisions
  }

  fn decide_ready(
    &self,
    task: &TaskNode,
    branch: Branch,
    expressions: &Expressions,
    vars: &serde_json::Value,
  ) -> Decision {
    let task_id = task.id.clone();

    if let Some(condition) = &task.condition {
      match expressions.evaluate_bool(condition, vars) {
        Ok(true) => {}
        Ok(false) => {
          return Decision::Skip {
            task_id,
            branch,
            reason: SkipReason::ConditionFalse,
          };
        }
        Err(e) => {
          return Decision::Fail {
            task_id,
            branch,
            message: format!("condition: {e}"),
          };
        }
      }
    }

    let items = match &task.for_each {
      None => None,
      Some(expression) => match expressions.evaluate_list(expression, vars) {
        Ok(items) if items.is_empty() => {
          return Decision::Skip {
            task_id,
            branch,
            reason: SkipReason::EmptyIteration,
          };
        }
        Ok(items) => Some(items),
        Err(e) => {
          return Decision::Fail {
            task_id,
            branch,
            message: format!("forEach: {e}"),
          };
        }
      },
    };

    Decision::Run {
      task_id,
      branch,
      items,
    }
  }
}
