use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use tokio::sync::{Mutex, RwLock};

use crate::{
  Clock, Error, Execution, ExecutionRepository, Lease, LeaseStore, TriggerKey, TriggerState,
  TriggerStateStore,
};

/// Executions held in process memory.
#[derive(Default)]
pub struct MemoryExecutionRepository {
  executions: RwLock<HashMap<String, Execution>>,
}

impl MemoryExecutionRepository {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl ExecutionRepository for MemoryExecutionRepository {
  async fn save(&self, execution: &mut Execution) -> Result<(), Error> {
    let mut executions = self.executions.write().await;
    let actual = executions.get(&execution.id).map_or(0, |e| e.version);
    if actual != execution.version {
      return Err(Error::Conflict {
        id: execution.id.clone(),
        expected: execution.version,
        actual,
      });
    }
    execution.version += 1;
    executions.insert(execution.id.clone(), execution.clone());
    Ok(())
  }

  async fn find(&self, execution_id: &str) -> Result<Option<Execution>, Error> {
    Ok(self.executions.read().await.get(execution_id).cloned())
  }

  async fn list_active(&self) -> Result<Vec<Execution>, Error> {
    Ok(
      self
        .executions
        .read()
        .await
        .values()
        .filter(|e| !e.is_terminal())
        .cloned()
        .collect(),
    )
  }

  async fn list_by_flow(&self, namespace: &str, flow_id: &str) -> Result<Vec<Execution>, Error> {
    let mut found: Vec<Execution> = self
      .executions
      .read()
      .await
      .values()
      .filter(|e| e.flow.namespace == namespace && e.flow.id == flow_id)
      .cloned()
      .collect();
    found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(found)
  }
}

/// Leases held in process memory, timed by a [`Clock`].
pub struct MemoryLeaseStore {
  clock: Clock,
  state: Mutex<LeaseTable>,
}

#[derive(Default)]
struct LeaseTable {
  leases: HashMap<String, Lease>,
  next_token: u64,
}

impl MemoryLeaseStore {
  pub fn new(clock: Clock) -> Self {
    Self {
      clock,
      state: Mutex::new(LeaseTable::default()),
    }
  }
}

impl Default for MemoryLeaseStore {
  fn default() -> Self {
    Self::new(Clock::new())
  }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
  async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>, Error> {
    let now = self.clock.now();
    let expires_at = now + TimeDelta::from_std(ttl).unwrap_or(TimeDelta::zero());
    let mut table = self.state.lock().await;

    if let Some(current) = table.leases.get_mut(key) {
      if !current.is_expired(now) {
        if current.owner != owner {
          return Ok(None);
        }
        current.expires_at = expires_at;
        return Ok(Some(current.clone()));
      }
    }

    table.next_token += 1;
    let lease = Lease {
      key: key.to_string(),
      owner: owner.to_string(),
      token: table.next_token,
      expires_at,
    };
    table.leases.insert(key.to_string(), lease.clone());
    Ok(Some(lease))
  }

  async fn release(&self, lease: &Lease) -> Result<(), Error> {
    let mut table = self.state.lock().await;
    if table
      .leases
      .get(&lease.key)
      .is_some_and(|current| current.token == lease.token)
    {
      table.leases.remove(&lease.key);
    }
    Ok(())
  }

  async fn holder(&self, key: &str) -> Result<Option<Lease>, Error> {
    let now = self.clock.now();
    let table = self.state.lock().await;
    Ok(
      table
        .leases
        .get(key)
        .filter(|l| !l.is_expired(now))
        .cloned(),
    )
  }
}

/// Trigger state held in process memory.
#[derive(Default)]
pub struct MemoryTriggerStateStore {
  states: RwLock<HashMap<TriggerKey, TriggerState>>,
}

impl MemoryTriggerStateStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl TriggerStateStore for MemoryTriggerStateStore {
  async fn get(&self, key: &TriggerKey) -> Result<Option<TriggerState>, Error> {
    Ok(self.states.read().await.get(key).cloned())
  }

  async fn save(&self, state: &mut TriggerState) -> Result<(), Error> {
    let mut states = self.states.write().await;
    let actual = states.get(&state.key).map_or(0, |s| s.version);
    if actual != state.version {
      return Err(Error::Conflict {
        id: state.key.to_string(),
        expected: state.version,
        actual,
      });
    }
    state.version += 1;
    states.insert(state.key.clone(), state.clone());
    Ok(())
  }
}
