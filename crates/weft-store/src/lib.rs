//! Weft Store
//!
//! The execution model and the repositories it is persisted in.
//!
//! - [`Execution`] and [`TaskRun`] carry the state machine data
//! - [`ExecutionRepository`] persists executions with optimistic versioning
//! - [`LeaseStore`] hands out expiring, fenced ownership of executions and
//!   triggers so several instances of a role can run side by side
//! - [`TriggerStateStore`] keeps scheduler watermarks and dedup records
//!
//! In-memory implementations back tests and single-process deployments;
//! [`SqliteStore`] persists executions and trigger state.

mod clock;
mod execution;
mod lease;
mod memory;
mod sqlite;
mod task_run;
mod trigger_state;
mod types;

pub use clock::Clock;
pub use execution::{Execution, OutboxEntry, StateChange};
pub use lease::Lease;
pub use memory::{MemoryExecutionRepository, MemoryLeaseStore, MemoryTriggerStateStore};
pub use sqlite::SqliteStore;
pub use task_run::{Attempt, TaskRun};
pub use trigger_state::{FireRecord, PendingFire, TriggerKey, TriggerState};
pub use types::{
  Branch, ErrorKind, ExecutionState, FlowRef, ParentRef, SkipReason, TaskRunError, TaskRunState,
  TriggerKind, TriggeringContext,
};

use std::time::Duration;

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("not found: {0}")]
  NotFound(String),

  /// The record changed since it was read.
  #[error("version conflict on '{id}': expected {expected}, found {actual}")]
  Conflict {
    id: String,
    expected: u64,
    actual: u64,
  },

  #[error("execution '{execution_id}' cannot move from {from} to {to}")]
  InvalidTransition {
    execution_id: String,
    from: ExecutionState,
    to: ExecutionState,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration error: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),
}

/// Persistence for executions.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
  /// Store `execution` if nobody saved it since it was read.
  ///
  /// `execution.version` must equal the stored version (0 for a new record);
  /// on success it is incremented to the new stored version.
  async fn save(&self, execution: &mut Execution) -> Result<(), Error>;

  async fn find(&self, execution_id: &str) -> Result<Option<Execution>, Error>;

  /// Executions that have not reached a terminal state.
  async fn list_active(&self) -> Result<Vec<Execution>, Error>;

  /// Executions of one flow, most recent first.
  async fn list_by_flow(&self, namespace: &str, flow_id: &str) -> Result<Vec<Execution>, Error>;
}

/// Expiring exclusive ownership of keys.
#[async_trait]
pub trait LeaseStore: Send + Sync {
  /// Take or extend ownership of `key` for `ttl`.
  ///
  /// Returns `None` while another owner holds an unexpired lease. Extending
  /// a lease keeps its token; taking over issues a new one.
  async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>, Error>;

  /// Give up a lease. A no-op if it was already taken over.
  async fn release(&self, lease: &Lease) -> Result<(), Error>;

  /// The current unexpired holder of `key`.
  async fn holder(&self, key: &str) -> Result<Option<Lease>, Error>;
}

/// Persistence for scheduler bookkeeping.
#[async_trait]
pub trait TriggerStateStore: Send + Sync {
  async fn get(&self, key: &TriggerKey) -> Result<Option<TriggerState>, Error>;

  /// Optimistically versioned like [`ExecutionRepository::save`].
  async fn save(&self, state: &mut TriggerState) -> Result<(), Error>;
}
