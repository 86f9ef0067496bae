use serde_json::{Map, Value, json};
use weft_store::{Execution, TaskRun};

use crate::flow::Flow;

/// Variable scope templates and expressions are evaluated against.
///
/// | key         | content                                           |
/// |-------------|---------------------------------------------------|
/// | `flow`      | namespace, id and revision                        |
/// | `execution` | id, state and creation time                       |
/// | `inputs`    | flow input defaults overridden by execution inputs |
/// | `vars`      | flow `variables`                                  |
/// | `trigger`   | payload of the triggering context                 |
/// | `outputs`   | outputs of every task that produced some          |
pub fn execution_variables(flow: &Flow, execution: &Execution) -> Value {
  let mut inputs = flow.inputs.clone();
  for (k, v) in &execution.inputs {
    inputs.insert(k.clone(), v.clone());
  }

  let mut outputs = Map::new();
  for task_id in flow.task_ids() {
    if let Some(out) = execution.task_outputs(task_id) {
      outputs.insert(task_id.to_string(), out);
    }
  }

  json!({
    "flow": {
      "namespace": flow.namespace,
      "id": flow.id,
      "revision": flow.revision,
    },
    "execution": {
      "id": execution.id,
      "state": execution.state,
      "createdAt": execution.created_at,
    },
    "inputs": inputs,
    "vars": flow.variables,
    "trigger": execution.trigger.payload,
    "outputs": outputs,
  })
}

/// [`execution_variables`] plus a `taskrun` entry describing `run`.
pub fn task_run_variables(flow: &Flow, execution: &Execution, run: &TaskRun) -> Value {
  let mut vars = execution_variables(flow, execution);
  if let Value::Object(map) = &mut vars {
    map.insert(
      "taskrun".to_string(),
      json!({
        "id": run.id,
        "taskId": run.task_id,
        "iteration": run.iteration,
        "attempt": run.attempt,
        "value": run.value,
      }),
    );
  }
  vars
}
