use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};
use weft_plugin::{
  Capability, Plugin, PluginError, PluginRegistry, TriggerPolicy, is_valid_type_name,
};
use weft_store::Branch;

use crate::cron::parse_cron;
use crate::document::{FlowDocument, TaskDef, TriggerDef};
use crate::error::FlowError;
use crate::expression::Expressions;
use crate::flow::{Flow, TaskNode, TriggerNode};
use crate::graph::Graph;

/// Turns flow documents into validated [`Flow`]s.
///
/// Every plugin type is resolved here, so an unknown type or an invalid
/// configuration fails the load instead of a later run.
pub struct FlowLoader {
  registry: Arc<PluginRegistry>,
  expressions: Expressions,
}

impl FlowLoader {
  pub fn new(registry: Arc<PluginRegistry>) -> Self {
    Self {
      registry,
      expressions: Expressions::new(),
    }
  }

  pub fn registry(&self) -> &Arc<PluginRegistry> {
    &self.registry
  }

  /// Parse and load a YAML or JSON document.
  pub fn load_str(&self, text: &str) -> Result<Flow, FlowError> {
    self.load(FlowDocument::parse(text)?)
  }

  pub async fn load_file(&self, path: &Path) -> Result<Flow, FlowError> {
    let text = tokio::fs::read_to_string(path)
      .await
      .map_err(|source| FlowError::Io {
        path: path.display().to_string(),
        source,
      })?;
    self.load_str(&text)
  }

  /// Load every `.yaml`, `.yml` and `.json` file in `dir`, in file name order.
  pub async fn load_dir(&self, dir: &Path) -> Result<Vec<Flow>, FlowError> {
    let io_error = |source| FlowError::Io {
      path: dir.display().to_string(),
      source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
      let path = entry.path();
      let is_flow = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e, "yaml" | "yml" | "json"));
      if is_flow {
        paths.push(path);
      }
    }
    paths.sort();

    let mut flows = Vec::with_capacity(paths.len());
    for path in paths {
      flows.push(self.load_file(&path).await?);
    }
    Ok(flows)
  }

  /// Validate a document and resolve its plugins.
  #[instrument(name = "load_flow", skip(self, doc), fields(namespace = %doc.namespace, flow_id = %doc.id))]
  pub fn load(&self, doc: FlowDocument) -> Result<Flow, FlowError> {
    let flow_name = format!("{}.{}", doc.namespace, doc.id);
    let invalid = |message: String| FlowError::Validation {
      flow: flow_name.clone(),
      message,
    };

    if !is_valid_id(&doc.id) {
      return Err(invalid(format!("invalid flow id '{}'", doc.id)));
    }
    if !doc.namespace.split('.').all(is_valid_id) {
      return Err(invalid(format!("invalid namespace '{}'", doc.namespace)));
    }

    let main = enabled(&doc.tasks);
    let errors = enabled(&doc.errors);
    let listeners = enabled(&doc.listeners);
    if main.is_empty() {
      return Err(invalid("flow must declare at least one enabled task".to_string()));
    }

    let mut seen = HashSet::new();
    for task in main.iter().chain(&errors).chain(&listeners) {
      self.check_identity(&flow_name, &task.id, &task.type_name, &mut seen)?;
    }
    let mut seen_triggers = HashSet::new();
    for trigger in &doc.triggers {
      self.check_identity(&flow_name, &trigger.id, &trigger.type_name, &mut seen_triggers)?;
    }

    let main_graph = self.build_graph(&flow_name, &main)?;
    let errors_graph = self.build_graph(&flow_name, &errors)?;
    let listeners_graph = self.build_graph(&flow_name, &listeners)?;

    let tasks = self.resolve_tasks(&main, Branch::Main)?;
    let errors = self.resolve_tasks(&errors, Branch::Errors)?;
    let listeners = self.resolve_tasks(&listeners, Branch::Listeners)?;
    let triggers = doc
      .triggers
      .iter()
      .map(|t| self.resolve_trigger(t))
      .collect::<Result<Vec<_>, _>>()?;

    info!(
      tasks = tasks.len(),
      errors = errors.len(),
      listeners = listeners.len(),
      triggers = triggers.len(),
      "flow loaded"
    );

    Ok(Flow {
      namespace: doc.namespace,
      id: doc.id,
      revision: doc.revision,
      description: doc.description,
      inputs: doc.inputs,
      variables: doc.variables,
      disabled: doc.disabled,
      tasks,
      errors,
      listeners,
      triggers,
      main_graph,
      errors_graph,
      listeners_graph,
    })
  }

  fn check_identity(
    &self,
    flow: &str,
    id: &str,
    type_name: &str,
    seen: &mut HashSet<String>,
  ) -> Result<(), FlowError> {
    if !is_valid_id(id) {
      return Err(FlowError::Validation {
        flow: flow.to_string(),
        message: format!("invalid id '{id}'"),
      });
    }
    if !is_valid_type_name(type_name) {
      return Err(FlowError::PluginResolution {
        id: id.to_string(),
        source: PluginError::InvalidTypeName(type_name.to_string()),
      });
    }
    if !seen.insert(id.to_string()) {
      return Err(FlowError::DuplicateId {
        flow: flow.to_string(),
        id: id.to_string(),
      });
    }
    Ok(())
  }

  fn build_graph(&self, flow: &str, tasks: &[TaskDef]) -> Result<Graph, FlowError> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
      for dep in task.depends_on.iter().flatten() {
        if !ids.contains(dep.as_str()) {
          return Err(FlowError::UnknownDependency {
            task_id: task.id.clone(),
            dependency: dep.clone(),
          });
        }
      }
    }

    let graph = Graph::from_tasks(tasks);
    if let Some(task_id) = graph.find_cycle() {
      return Err(FlowError::CycleDetected {
        flow: flow.to_string(),
        task_id: task_id.to_string(),
      });
    }
    Ok(graph)
  }

  fn resolve_tasks(&self, tasks: &[TaskDef], branch: Branch) -> Result<Vec<TaskNode>, FlowError> {
    tasks.iter().map(|t| self.resolve_task(t, branch)).collect()
  }

  fn resolve_task(&self, def: &TaskDef, branch: Branch) -> Result<TaskNode, FlowError> {
    let resolution = |source| FlowError::PluginResolution {
      id: def.id.clone(),
      source,
    };

    let capability = self.registry.resolve(&def.type_name).map_err(resolution)?;
    if let Capability::Trigger(_) = capability {
      return Err(resolution(PluginError::CapabilityMismatch {
        type_name: def.type_name.clone(),
        expected: "task".to_string(),
        actual: capability.kind().to_string(),
      }));
    }

    let config = serde_json::Value::Object(def.config.clone());
    capability.validate(&config).map_err(resolution)?;

    let expression_error = |message: String| FlowError::Expression {
      id: def.id.clone(),
      message,
    };
    self
      .expressions
      .check_templates(&config)
      .map_err(expression_error)?;
    for expression in def.condition.iter().chain(&def.for_each) {
      self.expressions.check(expression).map_err(expression_error)?;
    }

    if let Some(retry) = &def.retry {
      if retry.max_attempts == 0 {
        return Err(resolution(PluginError::InvalidConfig {
          type_name: def.type_name.clone(),
          message: "retry.maxAttempts must be at least 1".to_string(),
        }));
      }
    }

    Ok(TaskNode {
      id: def.id.clone(),
      type_name: def.type_name.clone(),
      kind: capability.kind(),
      branch,
      config,
      retry: def.retry.clone(),
      allow_failure: def.allow_failure,
      timeout: def.timeout.map(Duration::from_millis),
      condition: def.condition.clone(),
      for_each: def.for_each.clone(),
    })
  }

  fn resolve_trigger(&self, def: &TriggerDef) -> Result<TriggerNode, FlowError> {
    let resolution = |source| FlowError::PluginResolution {
      id: def.id.clone(),
      source,
    };

    let plugin = self.registry.trigger(&def.type_name).map_err(resolution)?;
    let config = serde_json::Value::Object(def.config.clone());
    plugin.validate(&config).map_err(resolution)?;

    let policy = plugin.policy(&config).map_err(resolution)?;
    match &policy {
      TriggerPolicy::Schedule { cron } => {
        parse_cron(cron).map_err(|message| {
          resolution(PluginError::InvalidConfig {
            type_name: def.type_name.clone(),
            message: format!("invalid cron expression '{cron}': {message}"),
          })
        })?;
      }
      TriggerPolicy::Poll { interval } if interval.is_zero() => {
        return Err(resolution(PluginError::InvalidConfig {
          type_name: def.type_name.clone(),
          message: "poll interval must be positive".to_string(),
        }));
      }
      TriggerPolicy::Poll { .. } => {}
    }

    Ok(TriggerNode {
      id: def.id.clone(),
      type_name: def.type_name.clone(),
      config,
      plugin,
      policy,
      dedup_window: def.dedup_window.map(Duration::from_millis),
      disabled: def.disabled,
    })
  }
}

/// `[a-zA-Z0-9][a-zA-Z0-9_-]*`
pub fn is_valid_id(id: &str) -> bool {
  let mut chars = id.chars();
  chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Drop disabled tasks, along with references to them.
fn enabled(tasks: &[TaskDef]) -> Vec<TaskDef> {
  let disabled: HashSet<&str> = tasks
    .iter()
    .filter(|t| t.disabled)
    .map(|t| t.id.as_str())
    .collect();
  tasks
    .iter()
    .filter(|t| !t.disabled)
    .cloned()
    .map(|mut t| {
      if let Some(deps) = &mut t.depends_on {
        deps.retain(|d| !disabled.contains(d.as_str()));
      }
      t
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::registry;

  fn loader() -> FlowLoader {
    FlowLoader::new(registry())
  }

  #[test]
  fn test_load_resolves_plugins() {
    let flow = loader()
      .load_str(
        r#"
id: hello
namespace: demo.team
tasks:
  - id: a
    type: test.Noop
    timeout: 250
  - id: b
    type: test.Noop
triggers:
  - id: nightly
    type: test.Cron
    cron: "0 2 * * *"
    dedupWindow: 1000
"#,
      )
      .unwrap();

    assert_eq!(flow.root_tasks(), ["a".to_string()]);
    assert_eq!(flow.tasks[0].timeout, Some(Duration::from_millis(250)));
    assert_eq!(flow.triggers.len(), 1);
    assert_eq!(
      flow.triggers[0].policy,
      TriggerPolicy::Schedule {
        cron: "0 2 * * *".to_string()
      }
    );
    assert_eq!(flow.triggers[0].dedup_window, Some(Duration::from_secs(1)));
  }

  #[test]
  fn test_unknown_type_fails_at_load() {
    let err = loader()
      .load_str("id: f\nnamespace: ns\ntasks:\n  - id: a\n    type: test.Missing\n")
      .unwrap_err();
    assert!(matches!(
      err,
      FlowError::PluginResolution {
        source: PluginError::NotFound(_),
        ..
      }
    ));
  }

  #[test]
  fn test_trigger_used_as_task() {
    let err = loader()
      .load_str("id: f\nnamespace: ns\ntasks:\n  - id: a\n    type: test.Cron\n")
      .unwrap_err();
    assert!(matches!(
      err,
      FlowError::PluginResolution {
        source: PluginError::CapabilityMismatch { .. },
        ..
      }
    ));
  }

  #[test]
  fn test_plugin_rejects_config() {
    let err = loader()
      .load_str("id: f\nnamespace: ns\ntasks:\n  - id: a\n    type: test.Noop\n    invalid: 1\n")
      .unwrap_err();
    assert!(matches!(
      err,
      FlowError::PluginResolution {
        source: PluginError::InvalidConfig { .. },
        ..
      }
    ));
  }

  #[test]
  fn test_invalid_ids() {
    let err = loader()
      .load_str("id: f\nnamespace: ns\ntasks:\n  - id: _a\n    type: test.Noop\n")
      .unwrap_err();
    assert!(matches!(err, FlowError::Validation { .. }));

    let err = loader()
      .load_str("id: f\nnamespace: ns\ntasks:\n  - id: a\n    type: Noop\n")
      .unwrap_err();
    assert!(matches!(
      err,
      FlowError::PluginResolution {
        source: PluginError::InvalidTypeName(_),
        ..
      }
    ));
  }

  #[test]
  fn test_duplicate_ids_across_branches() {
    let err = loader()
      .load_str(
        r#"
id: f
namespace: ns
tasks:
  - id: a
    type: test.Noop
errors:
  - id: a
    type: test.Noop
"#,
      )
      .unwrap_err();
    assert!(matches!(err, FlowError::DuplicateId { id, .. } if id == "a"));
  }

  #[test]
  fn test_unknown_dependency() {
    let err = loader()
      .load_str(
        "id: f\nnamespace: ns\ntasks:\n  - id: a\n    type: test.Noop\n    dependsOn: [zz]\n",
      )
      .unwrap_err();
    assert!(matches!(err, FlowError::UnknownDependency { dependency, .. } if dependency == "zz"));
  }

  #[test]
  fn test_cycle_rejected() {
    let err = loader()
      .load_str(
        r#"
id: f
namespace: ns
tasks:
  - id: a
    type: test.Noop
    dependsOn: [b]
  - id: b
    type: test.Noop
    dependsOn: [a]
"#,
      )
      .unwrap_err();
    assert!(matches!(err, FlowError::CycleDetected { .. }));
  }

  #[test]
  fn test_invalid_cron_rejected() {
    let err = loader()
      .load_str(
        r#"
id: f
namespace: ns
tasks:
  - id: a
    type: test.Noop
triggers:
  - id: t
    type: test.Cron
    cron: "not a cron"
"#,
      )
      .unwrap_err();
    assert!(matches!(
      err,
      FlowError::PluginResolution {
        source: PluginError::InvalidConfig { .. },
        ..
      }
    ));
  }

  #[test]
  fn test_invalid_condition_rejected() {
    let err = loader()
      .load_str(
        "id: f\nnamespace: ns\ntasks:\n  - id: a\n    type: test.Noop\n    condition: \"x >\"\n",
      )
      .unwrap_err();
    assert!(matches!(err, FlowError::Expression { .. }));
  }

  #[test]
  fn test_disabled_tasks_dropped() {
    let flow = loader()
      .load_str(
        r#"
id: f
namespace: ns
tasks:
  - id: a
    type: test.Noop
  - id: b
    type: test.Noop
    disabled: true
  - id: c
    type: test.Noop
    dependsOn: [a, b]
"#,
      )
      .unwrap();
    assert!(flow.task("b").is_none());
    assert_eq!(flow.graph(Branch::Main).upstream("c"), ["a".to_string()]);
  }

  #[tokio::test]
  async fn test_load_dir() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(
      dir.path().join("b.yaml"),
      "id: b\nnamespace: ns\ntasks:\n  - id: a\n    type: test.Noop\n",
    )
    .await
    .unwrap();
    tokio::fs::write(
      dir.path().join("a.json"),
      r#"{"id": "a", "namespace": "ns", "tasks": [{"id": "x", "type": "test.Noop"}]}"#,
    )
    .await
    .unwrap();
    tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

    let flows = loader().load_dir(dir.path()).await.unwrap();
    let ids: Vec<&str> = flows.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
  }

  #[test]
  fn test_is_valid_id() {
    assert!(is_valid_id("a"));
    assert!(is_valid_id("9-lives_x"));
    assert!(!is_valid_id(""));
    assert!(!is_valid_id("-a"));
    assert!(!is_valid_id("a.b"));
  }
}
