use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::flow::Flow;

/// Loaded flows, by namespace, id and revision.
///
/// Flows are handed out as `Arc`s and never mutated; deploying a new
/// revision adds an entry instead of changing an existing one.
#[derive(Default)]
pub struct FlowRepository {
  flows: RwLock<HashMap<(String, String), BTreeMap<u32, Arc<Flow>>>>,
}

impl FlowRepository {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn save(&self, flow: Flow) -> Arc<Flow> {
    let flow = Arc::new(flow);
    let mut flows = self.flows.write().await;
    let revisions = flows
      .entry((flow.namespace.clone(), flow.id.clone()))
      .or_default();
    if revisions.contains_key(&flow.revision) {
      warn!(
        namespace = %flow.namespace,
        flow_id = %flow.id,
        revision = flow.revision,
        "flow revision replaced"
      );
    }
    revisions.insert(flow.revision, flow.clone());
    flow
  }

  /// A specific revision, or the latest one when `revision` is `None`.
  pub async fn find(&self, namespace: &str, id: &str, revision: Option<u32>) -> Option<Arc<Flow>> {
    let flows = self.flows.read().await;
    let revisions = flows.get(&(namespace.to_string(), id.to_string()))?;
    match revision {
      Some(rev) => revisions.get(&rev).cloned(),
      None => revisions.values().next_back().cloned(),
    }
  }

  /// Latest revision of every flow.
  pub async fn list_latest(&self) -> Vec<Arc<Flow>> {
    let flows = self.flows.read().await;
    let mut latest: Vec<Arc<Flow>> = flows
      .values()
      .filter_map(|revisions| revisions.values().next_back().cloned())
      .collect();
    latest.sort_by(|a, b| (&a.namespace, &a.id).cmp(&(&b.namespace, &b.id)));
    latest
  }

  /// Next free revision number for a flow.
  pub async fn next_revision(&self, namespace: &str, id: &str) -> u32 {
    let flows = self.flows.read().await;
    flows
      .get(&(namespace.to_string(), id.to_string()))
      .and_then(|revisions| revisions.keys().next_back())
      .map_or(1, |rev| rev + 1)
  }
}
