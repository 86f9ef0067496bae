use std::collections::{HashMap, HashSet};

use crate::document::TaskDef;

/// Dependency graph of one branch of a flow.
///
/// Edges run from a task to the tasks that wait for it. A task without
/// `dependsOn` waits for the task declared before it.
#[derive(Debug, Clone, Default)]
pub struct Graph {
  /// Task ids in document order.
  order: Vec<String>,
  /// task_id -> tasks waiting for it.
  adjacency: HashMap<String, Vec<String>>,
  /// task_id -> tasks it waits for.
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Tasks with no predecessors, in document order.
  entry_points: Vec<String>,
  /// Tasks with more than one predecessor.
  join_points: HashSet<String>,
}

impl Graph {
  /// Build a graph from node ids (in document order) and `(from, to)` edges.
  pub fn new(order: Vec<String>, edges: &[(String, String)]) -> Self {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();

    for id in &order {
      adjacency.entry(id.clone()).or_default();
      reverse_adjacency.entry(id.clone()).or_default();
    }

    for (from, to) in edges {
      adjacency.entry(from.clone()).or_default().push(to.clone());
      reverse_adjacency
        .entry(to.clone())
        .or_default()
        .push(from.clone());
    }

    let entry_points = order
      .iter()
      .filter(|id| reverse_adjacency.get(*id).is_none_or(|v| v.is_empty()))
      .cloned()
      .collect();

    let join_points = reverse_adjacency
      .iter()
      .filter(|(_, incoming)| incoming.len() > 1)
      .map(|(id, _)| id.clone())
      .collect();

    Self {
      order,
      adjacency,
      reverse_adjacency,
      entry_points,
      join_points,
    }
  }

  /// Derive edges from task definitions.
  pub fn from_tasks(tasks: &[TaskDef]) -> Self {
    let order: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    Self::new(order, &Self::edges(tasks))
  }

  /// Edges implied by `dependsOn`, falling back to document order.
  pub fn edges(tasks: &[TaskDef]) -> Vec<(String, String)> {
    let mut edges = Vec::new();
    let mut previous: Option<&str> = None;
    for task in tasks {
      match &task.depends_on {
        Some(deps) => {
          for dep in deps {
            edges.push((dep.clone(), task.id.clone()));
          }
        }
        None => {
          if let Some(prev) = previous {
            edges.push((prev.to_string(), task.id.clone()));
          }
        }
      }
      previous = Some(&task.id);
    }
    edges
  }

  /// Task ids in document order.
  pub fn tasks(&self) -> &[String] {
    &self.order
  }

  /// Tasks with no predecessors.
  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  pub fn downstream(&self, task_id: &str) -> &[String] {
    self
      .adjacency
      .get(task_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  pub fn upstream(&self, task_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(task_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  pub fn is_join_point(&self, task_id: &str) -> bool {
    self.join_points.contains(task_id)
  }

  /// A task that is part of a cycle, if any.
  pub fn find_cycle(&self) -> Option<&str> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
      White,
      Gray,
      Black,
    }

    fn visit<'a>(
      node: &'a str,
      graph: &'a Graph,
      color: &mut HashMap<&'a str, Color>,
    ) -> Option<&'a str> {
      color.insert(node, Color::Gray);
      for next in graph.downstream(node) {
        match color.get(next.as_str()).copied().unwrap_or(Color::White) {
          Color::Gray => return Some(next.as_str()),
          Color::White => {
            if let Some(found) = visit(next, graph, color) {
              return Some(found);
            }
          }
          Color::Black => {}
        }
      }
      color.insert(node, Color::Black);
      None
    }

    let mut color: HashMap<&str, Color> = HashMap::new();
    for id in &self.order {
      if color.get(id.as_str()).copied().unwrap_or(Color::White) == Color::White {
        if let Some(found) = visit(id, self, &mut color) {
          return Some(found);
        }
      }
    }
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn task(id: &str, depends_on: Option<&[&str]>) -> TaskDef {
    TaskDef {
      id: id.to_string(),
      type_name: "test.Task".to_string(),
      retry: None,
      allow_failure: false,
      timeout: None,
      depends_on: depends_on.map(|d| d.iter().map(|s| s.to_string()).collect()),
      condition: None,
      for_each: None,
      disabled: false,
      config: serde_json::Map::new(),
    }
  }

  #[test]
  fn test_sequential_by_default() {
    let graph = Graph::from_tasks(&[task("a", None), task("b", None), task("c", None)]);
    assert_eq!(graph.entry_points(), ["a".to_string()]);
    assert_eq!(graph.upstream("b"), ["a".to_string()]);
    assert_eq!(graph.downstream("b"), ["c".to_string()]);
    assert!(graph.find_cycle().is_none());
  }

  #[test]
  fn test_fan_out_and_join() {
    let graph = Graph::from_tasks(&[
      task("a", None),
      task("b", Some(&["a"])),
      task("c", Some(&["a"])),
      task("d", Some(&["b", "c"])),
    ]);
    assert_eq!(graph.downstream("a"), ["b".to_string(), "c".to_string()]);
    assert!(graph.is_join_point("d"));
    assert!(!graph.is_join_point("b"));
  }

  #[test]
  fn test_explicit_empty_dependencies_are_roots() {
    let graph = Graph::from_tasks(&[task("a", None), task("b", Some(&[]))]);
    assert_eq!(graph.entry_points(), ["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn test_cycle_detected() {
    let graph = Graph::from_tasks(&[
      task("a", Some(&["c"])),
      task("b", Some(&["a"])),
      task("c", Some(&["b"])),
    ]);
    assert!(graph.find_cycle().is_some());
  }
}
