use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use weft_artifact::{BlobStore, FsStore, MemoryStore};
use weft_executor::Executor;
use weft_flow::{Flow, FlowLoader, FlowRepository};
use weft_plugin::PluginRegistry;
use weft_queue::{
  ExecutionEvent, KillRequest, MemoryQueue, Message, PauseRequest, Queue, ResumeRequest, Topic,
};
use weft_runtime::{EnvSecretProvider, Runtime, SecretProvider};
use weft_scheduler::Scheduler;
use weft_store::{
  Clock, Execution, ExecutionRepository, ExecutionState, LeaseStore, MemoryExecutionRepository,
  MemoryLeaseStore, MemoryTriggerStateStore, SqliteStore, TriggerStateStore, TriggeringContext,
};
use weft_worker::Worker;

use crate::config::{EngineConfig, Role, StorageConfig};
use crate::error::EngineError;

/// Consumer group of the engine's own execution update log.
pub const UPDATES_GROUP: &str = "engine";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Assembles an [`Engine`]. Anything not supplied is built from the config.
pub struct EngineBuilder {
  config: EngineConfig,
  registry: PluginRegistry,
  queue: Option<Arc<dyn Queue>>,
  clock: Option<Clock>,
  secrets: Option<Arc<dyn SecretProvider>>,
  blobs: Option<Arc<dyn weft_artifact::Store>>,
}

impl EngineBuilder {
  pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
    self.queue = Some(queue);
    self
  }

  pub fn clock(mut self, clock: Clock) -> Self {
    self.clock = Some(clock);
    self
  }

  pub fn secrets(mut self, secrets: Arc<dyn SecretProvider>) -> Self {
    self.secrets = Some(secrets);
    self
  }

  pub fn blobs(mut self, blobs: Arc<dyn weft_artifact::Store>) -> Self {
    self.blobs = Some(blobs);
    self
  }

  /// Open storage and deploy the flows in `flows_dir`, if any.
  pub async fn build(self) -> Result<Engine, EngineError> {
    let config = self.config;
    let clock = self.clock.unwrap_or_default();
    let queue = match self.queue {
      Some(queue) => queue,
      None => Arc::new(MemoryQueue::with_max_deliveries(
        config.executor.max_deliveries,
      )),
    };

    let (executions, triggers): (Arc<dyn ExecutionRepository>, Arc<dyn TriggerStateStore>) =
      match &config.storage {
        StorageConfig::Memory => (
          Arc::new(MemoryExecutionRepository::new()) as Arc<dyn ExecutionRepository>,
          Arc::new(MemoryTriggerStateStore::new()) as Arc<dyn TriggerStateStore>,
        ),
        StorageConfig::Sqlite { url } => {
          let store = Arc::new(SqliteStore::connect(url).await?);
          store.migrate().await?;
          (
            store.clone() as Arc<dyn ExecutionRepository>,
            store as Arc<dyn TriggerStateStore>,
          )
        }
      };
    let leases: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new(clock));

    let blobs: Arc<dyn weft_artifact::Store> = match (self.blobs, &config.blobs_dir) {
      (Some(blobs), _) => blobs,
      (None, Some(dir)) => Arc::new(FsStore::new(dir.clone())),
      (None, None) => Arc::new(MemoryStore::new()),
    };
    let secrets = self
      .secrets
      .unwrap_or_else(|| Arc::new(EnvSecretProvider::new(config.secret_prefix.clone())));
    let runtime = Runtime::new(BlobStore::new(blobs), secrets);

    let registry = Arc::new(self.registry);
    let engine = Engine {
      loader: FlowLoader::new(registry.clone()),
      registry,
      flows: Arc::new(FlowRepository::new()),
      executions,
      triggers,
      leases,
      queue,
      runtime,
      clock,
      config,
    };

    if let Some(dir) = engine.config.flows_dir.clone() {
      engine.deploy_dir(&dir).await?;
    }
    Ok(engine)
  }
}

/// Every role of the engine in one process, sharing one queue and one set
/// of repositories.
///
/// The engine only publishes messages and reads execution state; the roles
/// it starts do the work.
pub struct Engine {
  config: EngineConfig,
  registry: Arc<PluginRegistry>,
  loader: FlowLoader,
  flows: Arc<FlowRepository>,
  executions: Arc<dyn ExecutionRepository>,
  triggers: Arc<dyn TriggerStateStore>,
  leases: Arc<dyn LeaseStore>,
  queue: Arc<dyn Queue>,
  runtime: Runtime,
  clock: Clock,
}

impl Engine {
  pub fn builder(config: EngineConfig, registry: PluginRegistry) -> EngineBuilder {
    EngineBuilder {
      config,
      registry,
      queue: None,
      clock: None,
      secrets: None,
      blobs: None,
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn flows(&self) -> &Arc<FlowRepository> {
    &self.flows
  }

  /// Validate a YAML or JSON flow document and make it the latest revision.
  pub async fn deploy_str(&self, text: &str) -> Result<Arc<Flow>, EngineError> {
    let flow = self.loader.load_str(text)?;
    Ok(self.deploy(flow).await)
  }

  /// Deploy every flow document in `dir`. Nothing is deployed when one of
  /// them is invalid.
  pub async fn deploy_dir(&self, dir: &Path) -> Result<Vec<Arc<Flow>>, EngineError> {
    let loaded = self.loader.load_dir(dir).await?;
    let mut deployed = Vec::with_capacity(loaded.len());
    for flow in loaded {
      deployed.push(self.deploy(flow).await);
    }
    Ok(deployed)
  }

  /// A revision that is already deployed is never replaced: the flow gets
  /// the next free revision instead.
  async fn deploy(&self, mut flow: Flow) -> Arc<Flow> {
    let taken = self
      .flows
      .find(&flow.namespace, &flow.id, Some(flow.revision))
      .await
      .is_some();
    if taken {
      flow.revision = self.flows.next_revision(&flow.namespace, &flow.id).await;
    }
    let flow = self.flows.save(flow).await;
    info!(
      namespace = %flow.namespace,
      flow_id = %flow.id,
      revision = flow.revision,
      "flow deployed"
    );
    flow
  }

  /// Start a manual execution of the latest revision of a flow.
  #[instrument(name = "submit", skip(self, inputs))]
  pub async fn submit(
    &self,
    namespace: &str,
    flow_id: &str,
    inputs: Map<String, Value>,
  ) -> Result<String, EngineError> {
    let flow = self
      .flows
      .find(namespace, flow_id, None)
      .await
      .ok_or_else(|| EngineError::FlowNotFound {
        namespace: namespace.to_string(),
        flow_id: flow_id.to_string(),
      })?;

    let execution_id = uuid::Uuid::new_v4().to_string();
    let event = ExecutionEvent {
      execution_id: execution_id.clone(),
      flow: flow.reference(),
      state: ExecutionState::Created,
      trigger: TriggeringContext::manual(),
      inputs,
      parent: None,
    };
    self
      .queue
      .publish(Topic::Executor, Message::ExecutionEvent(event))
      .await?;
    info!(%execution_id, flow = %flow.reference(), "execution submitted");
    Ok(execution_id)
  }

  pub async fn kill(&self, execution_id: &str) -> Result<(), EngineError> {
    let request = KillRequest {
      execution_id: execution_id.to_string(),
    };
    self.request(Message::KillRequest(request)).await
  }

  pub async fn pause(&self, execution_id: &str) -> Result<(), EngineError> {
    let request = PauseRequest {
      execution_id: execution_id.to_string(),
    };
    self.request(Message::PauseRequest(request)).await
  }

  pub async fn resume(&self, execution_id: &str) -> Result<(), EngineError> {
    let request = ResumeRequest {
      execution_id: execution_id.to_string(),
    };
    self.request(Message::ResumeRequest(request)).await
  }

  async fn request(&self, message: Message) -> Result<(), EngineError> {
    debug!(kind = message.kind(), execution_id = %message.execution_id(), "request published");
    self.queue.publish(Topic::Executor, message).await?;
    Ok(())
  }

  pub async fn execution(&self, execution_id: &str) -> Result<Option<Execution>, EngineError> {
    Ok(self.executions.find(execution_id).await?)
  }

  pub async fn executions(
    &self,
    namespace: &str,
    flow_id: &str,
  ) -> Result<Vec<Execution>, EngineError> {
    Ok(self.executions.list_by_flow(namespace, flow_id).await?)
  }

  /// Wait until the execution reaches a terminal state.
  pub async fn wait_for(
    &self,
    execution_id: &str,
    timeout: Duration,
  ) -> Result<Execution, EngineError> {
    tokio::time::timeout(timeout, self.poll_terminal(execution_id))
      .await
      .map_err(|_| EngineError::Timeout(execution_id.to_string()))?
  }

  async fn poll_terminal(&self, execution_id: &str) -> Result<Execution, EngineError> {
    loop {
      if let Some(execution) = self.executions.find(execution_id).await? {
        if execution.is_terminal() {
          return Ok(execution);
        }
      }
      tokio::time::sleep(POLL_INTERVAL).await;
    }
  }

  /// Run the configured roles until `cancel` fires.
  ///
  /// A role that fails cancels the others; the first failure is returned.
  pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), EngineError> {
    let mut roles = JoinSet::new();

    if self.config.runs(Role::Executor) {
      let executor = Arc::new(Executor::new(
        self.config.executor.clone(),
        self.flows.clone(),
        self.executions.clone(),
        self.leases.clone(),
        self.queue.clone(),
        self.clock,
      ));
      let cancel = cancel.clone();
      roles.spawn(async move { executor.start(cancel).await.map_err(EngineError::from) });
    }

    if self.config.runs(Role::Worker) {
      let count = self.config.workers.max(1);
      for index in 0..count {
        let mut config = self.config.worker.clone();
        if count > 1 {
          config.worker_id = format!("{}-{index}", config.worker_id);
        }
        let worker = Arc::new(Worker::new(
          config,
          self.queue.clone(),
          self.leases.clone(),
          self.registry.clone(),
          self.runtime.clone(),
        ));
        let cancel = cancel.clone();
        roles.spawn(async move { worker.start(cancel).await.map_err(EngineError::from) });
      }
    }

    if self.config.runs(Role::Scheduler) {
      let scheduler = Arc::new(Scheduler::new(
        self.config.scheduler.clone(),
        self.flows.clone(),
        self.triggers.clone(),
        self.leases.clone(),
        self.queue.clone(),
        self.clock,
      ));
      let cancel = cancel.clone();
      roles.spawn(async move {
        scheduler.start(cancel).await;
        Ok(())
      });
    }

    let queue = self.queue.clone();
    let updates_cancel = cancel.clone();
    roles.spawn(async move { watch_updates(queue, updates_cancel).await });

    info!(roles = ?self.config.roles, workers = self.config.workers, "engine started");

    let mut result = Ok(());
    while let Some(joined) = roles.join_next().await {
      if let Err(e) = joined.map_err(EngineError::from).and_then(|r| r) {
        error!(error = %e, "engine role failed");
        cancel.cancel();
        if result.is_ok() {
          result = Err(e);
        }
      }
    }

    info!("engine stopped");
    result
  }
}

/// Log every execution state change.
async fn watch_updates(queue: Arc<dyn Queue>, cancel: CancellationToken) -> Result<(), EngineError> {
  let mut updates = queue.subscribe(Topic::ExecutionUpdates, UPDATES_GROUP).await?;
  loop {
    let delivery = tokio::select! {
      _ = cancel.cancelled() => break,
      next = updates.next() => match next {
        Some(delivery) => delivery,
        None => break,
      },
    };
    if let Message::ExecutionEvent(event) = delivery.message() {
      info!(
        execution_id = %event.execution_id,
        flow = %event.flow,
        state = event.state.as_str(),
        "execution state changed"
      );
    }
    delivery.ack();
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use weft_plugin::{Capability, Output, Plugin, PluginInfo, Task, TaskContext, TaskError};

  struct Noop(PluginInfo);

  impl Plugin for Noop {
    fn info(&self) -> &PluginInfo {
      &self.0
    }
  }

  #[async_trait]
  impl Task for Noop {
    async fn run(
      &self,
      _ctx: &dyn TaskContext,
      _config: &serde_json::Value,
    ) -> Result<Output, TaskError> {
      Ok(Output::empty())
    }
  }

  fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry
      .register_instance(Capability::Task(Arc::new(Noop(PluginInfo::new(
        "test.Noop", "1.0.0", "Noop",
      )))))
      .unwrap();
    registry
  }

  const FLOW: &str = "id: hello\nnamespace: demo\ntasks:\n  - id: a\n    type: test.Noop\n";

  async fn engine() -> Engine {
    Engine::builder(EngineConfig::default(), registry())
      .build()
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_redeploy_gets_next_revision() {
    let engine = engine().await;
    assert_eq!(engine.deploy_str(FLOW).await.unwrap().revision, 1);
    assert_eq!(engine.deploy_str(FLOW).await.unwrap().revision, 2);

    let pinned = format!("{FLOW}revision: 7\n");
    assert_eq!(engine.deploy_str(&pinned).await.unwrap().revision, 7);
    let latest = engine.flows().find("demo", "hello", None).await.unwrap();
    assert_eq!(latest.revision, 7);
  }

  #[tokio::test]
  async fn test_invalid_document_is_rejected() {
    let engine = engine().await;
    let err = engine
      .deploy_str("id: hello\nnamespace: demo\ntasks:\n  - id: a\n    type: test.Missing\n")
      .await
      .unwrap_err();
    assert!(matches!(err, EngineError::Flow(_)));
    assert!(engine.flows().find("demo", "hello", None).await.is_none());
  }

  #[tokio::test]
  async fn test_submit_unknown_flow() {
    let engine = engine().await;
    let err = engine.submit("demo", "nope", Map::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::FlowNotFound { .. }));
  }

  #[tokio::test]
  async fn test_submit_publishes_created_event() {
    let queue = MemoryQueue::new();
    let mut inbox = queue.subscribe(Topic::Executor, "test").await.unwrap();
    let engine = Engine::builder(EngineConfig::default(), registry())
      .queue(Arc::new(queue))
      .build()
      .await
      .unwrap();
    engine.deploy_str(FLOW).await.unwrap();

    let inputs = Map::from_iter([("name".to_string(), Value::from("weft"))]);
    let id = engine.submit("demo", "hello", inputs).await.unwrap();

    let delivery = inbox.next().await.unwrap();
    match delivery.message() {
      Message::ExecutionEvent(event) => {
        assert_eq!(event.execution_id, id);
        assert_eq!(event.state, ExecutionState::Created);
        assert_eq!(event.flow.revision, 1);
        assert_eq!(event.inputs["name"], "weft");
        assert!(event.parent.is_none());
      }
      other => panic!("unexpected message: {other:?}"),
    }
    delivery.ack();
  }

  #[tokio::test]
  async fn test_deploy_dir_at_build() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("hello.yaml"), FLOW).await.unwrap();
    tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

    let config = EngineConfig {
      flows_dir: Some(dir.path().to_path_buf()),
      ..EngineConfig::default()
    };
    let engine = Engine::builder(config, registry()).build().await.unwrap();
    assert!(engine.flows().find("demo", "hello", Some(1)).await.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_wait_for_times_out() {
    let engine = engine().await;
    let err = engine
      .wait_for("missing", Duration::from_secs(1))
      .await
      .unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)));
  }
}
