use std::str::FromStr;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::{Error, Execution, ExecutionRepository, TriggerKey, TriggerState, TriggerStateStore};

/// SQLite-backed store for executions and trigger state.
///
/// Records are stored as JSON documents next to the columns needed for
/// lookups and the optimistic version check.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database at `url`, e.g.
  /// `sqlite://weft.db` or `sqlite::memory:`.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    // In-memory databases are per connection.
    let max_connections = if url.contains(":memory:") { 1 } else { 4 };
    let pool = SqlitePoolOptions::new()
      .max_connections(max_connections)
      .connect_with(options)
      .await?;
    Ok(Self::new(pool))
  }

  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("./migrations").run(&self.pool).await?;
    Ok(())
  }

  async fn execution_version(&self, execution_id: &str) -> Result<u64, Error> {
    let version: Option<i64> =
      sqlx::query_scalar("SELECT version FROM executions WHERE id = ?")
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;
    Ok(version.unwrap_or(0) as u64)
  }

  async fn trigger_version(&self, key: &TriggerKey) -> Result<u64, Error> {
    let version: Option<i64> = sqlx::query_scalar(
      r#"
      SELECT version FROM trigger_states
      WHERE namespace = ? AND flow_id = ? AND trigger_id = ?
      "#,
    )
    .bind(&key.namespace)
    .bind(&key.flow_id)
    .bind(&key.trigger_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(version.unwrap_or(0) as u64)
  }
}

fn decode_all<T: serde::de::DeserializeOwned>(documents: Vec<String>) -> Result<Vec<T>, Error> {
  documents
    .iter()
    .map(|d| serde_json::from_str(d).map_err(Error::from))
    .collect()
}

#[async_trait]
impl ExecutionRepository for SqliteStore {
  async fn save(&self, execution: &mut Execution) -> Result<(), Error> {
    let expected = execution.version;
    execution.version += 1;
    let document = match serde_json::to_string(execution) {
      Ok(document) => document,
      Err(e) => {
        execution.version = expected;
        return Err(e.into());
      }
    };

    let result = if expected == 0 {
      sqlx::query(
        r#"
        INSERT INTO executions (id, namespace, flow_id, state, version, document, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (id) DO NOTHING
        "#,
      )
      .bind(&execution.id)
      .bind(&execution.flow.namespace)
      .bind(&execution.flow.id)
      .bind(execution.state.as_str())
      .bind(execution.version as i64)
      .bind(&document)
      .bind(execution.created_at)
      .bind(execution.updated_at)
      .execute(&self.pool)
      .await
    } else {
      sqlx::query(
        r#"
        UPDATE executions
        SET state = ?, version = ?, document = ?, updated_at = ?
        WHERE id = ? AND version = ?
        "#,
      )
      .bind(execution.state.as_str())
      .bind(execution.version as i64)
      .bind(&document)
      .bind(execution.updated_at)
      .bind(&execution.id)
      .bind(expected as i64)
      .execute(&self.pool)
      .await
    };

    match result {
      Ok(done) if done.rows_affected() == 1 => Ok(()),
      Ok(_) => {
        execution.version = expected;
        Err(Error::Conflict {
          id: execution.id.clone(),
          expected,
          actual: self.execution_version(&execution.id).await?,
        })
      }
      Err(e) => {
        execution.version = expected;
        Err(e.into())
      }
    }
  }

  async fn find(&self, execution_id: &str) -> Result<Option<Execution>, Error> {
    let document: Option<String> =
      sqlx::query_scalar("SELECT document FROM executions WHERE id = ?")
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;
    document
      .map(|d| serde_json::from_str(&d).map_err(Error::from))
      .transpose()
  }

  async fn list_active(&self) -> Result<Vec<Execution>, Error> {
    let documents: Vec<String> = sqlx::query_scalar(
      r#"
      SELECT document FROM executions
      WHERE state NOT IN ('SUCCESS', 'WARNING', 'FAILED', 'KILLED')
      "#,
    )
    .fetch_all(&self.pool)
    .await?;
    decode_all(documents)
  }

  async fn list_by_flow(&self, namespace: &str, flow_id: &str) -> Result<Vec<Execution>, Error> {
    let documents: Vec<String> = sqlx::query_scalar(
      r#"
      SELECT document FROM executions
      WHERE namespace = ? AND flow_id = ?
      ORDER BY created_at DESC
      "#,
    )
    .bind(namespace)
    .bind(flow_id)
    .fetch_all(&self.pool)
    .await?;
    decode_all(documents)
  }
}

#[async_trait]
impl TriggerStateStore for SqliteStore {
  async fn get(&self, key: &TriggerKey) -> Result<Option<TriggerState>, Error> {
    let document: Option<String> = sqlx::query_scalar(
      r#"
      SELECT document FROM trigger_states
      WHERE namespace = ? AND flow_id = ? AND trigger_id = ?
      "#,
    )
    .bind(&key.namespace)
    .bind(&key.flow_id)
    .bind(&key.trigger_id)
    .fetch_optional(&self.pool)
    .await?;
    document
      .map(|d| serde_json::from_str(&d).map_err(Error::from))
      .transpose()
  }

  async fn save(&self, state: &mut TriggerState) -> Result<(), Error> {
    let expected = state.version;
    state.version += 1;
    let document = match serde_json::to_string(state) {
      Ok(document) => document,
      Err(e) => {
        state.version = expected;
        return Err(e.into());
      }
    };

    let result = if expected == 0 {
      sqlx::query(
        r#"
        INSERT INTO trigger_states (namespace, flow_id, trigger_id, version, document)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (namespace, flow_id, trigger_id) DO NOTHING
        "#,
      )
      .bind(&state.key.namespace)
      .bind(&state.key.flow_id)
      .bind(&state.key.trigger_id)
      .bind(state.version as i64)
      .bind(&document)
      .execute(&self.pool)
      .await
    } else {
      sqlx::query(
        r#"
        UPDATE trigger_states
        SET version = ?, document = ?
        WHERE namespace = ? AND flow_id = ? AND trigger_id = ? AND version = ?
        "#,
      )
      .bind(state.version as i64)
      .bind(&document)
      .bind(&state.key.namespace)
      .bind(&state.key.flow_id)
      .bind(&state.key.trigger_id)
      .bind(expected as i64)
      .execute(&self.pool)
      .await
    };

    match result {
      Ok(done) if done.rows_affected() == 1 => Ok(()),
      Ok(_) => {
        state.version = expected;
        Err(Error::Conflict {
          id: state.key.to_string(),
          expected,
          actual: self.trigger_version(&state.key).await?,
        })
      }
      Err(e) => {
        state.version = expected;
        Err(e.into())
      }
    }
  }
}
