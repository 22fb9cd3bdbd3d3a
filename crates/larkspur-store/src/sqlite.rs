use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use larkspur_config::Release;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::types::{
  NewNodeTask, NewRun, NewRunLog, NodeTask, NodeTaskUpdate, Run, RunLog, RunStatus,
};
use crate::{Store, StoreError};

const RUN_COLUMNS: &str = "id, workflow_id, release_id, status, input, output, error, \
                           started_at, finished_at, heartbeat_at, created_by, created_at";

const TASK_COLUMNS: &str = "id, run_id, node_id, status, attempt, input, output, error, \
                            metrics, started_at, finished_at, parent_task_id, branch_id, \
                            iteration, loop_node_id, run_seq";

/// SQLite-backed store implementation.
#[derive(Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

#[derive(FromRow)]
struct ReleaseRow {
  id: String,
  workflow_id: String,
  version: i64,
  spec: Json<Value>,
  checksum: String,
  created_at: DateTime<Utc>,
}

impl From<ReleaseRow> for Release {
  fn from(row: ReleaseRow) -> Self {
    Release {
      id: row.id,
      workflow_id: row.workflow_id,
      version: row.version,
      spec: row.spec.0,
      checksum: row.checksum,
      created_at: row.created_at,
    }
  }
}

impl SqliteStore {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) a database at `url` and run migrations.
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// In-memory database on a single connection, for tests and one-shot
  /// inline runs.
  pub async fn connect_in_memory() -> Result<Self, StoreError> {
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect("sqlite::memory:")
      .await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }
}

impl Store for SqliteStore {
  async fn create_release(&self, release: &Release) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO releases (id, workflow_id, version, spec, checksum, created_at)
      VALUES (?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&release.id)
    .bind(&release.workflow_id)
    .bind(release.version)
    .bind(Json(&release.spec))
    .bind(&release.checksum)
    .bind(release.created_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_release(&self, id: &str) -> Result<Release, StoreError> {
    let row: Option<ReleaseRow> = sqlx::query_as(
      "SELECT id, workflow_id, version, spec, checksum, created_at FROM releases WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(Release::from)
      .ok_or_else(|| StoreError::ReleaseNotFound(id.to_string()))
  }

  async fn create_run(&self, new: &NewRun) -> Result<Run, StoreError> {
    let query = format!(
      r#"
      INSERT INTO runs (id, workflow_id, release_id, status, input, created_by, created_at)
      VALUES (?, ?, ?, ?, ?, ?, ?)
      RETURNING {RUN_COLUMNS}
      "#
    );
    let run: Run = sqlx::query_as(&query)
      .bind(uuid::Uuid::new_v4().to_string())
      .bind(&new.workflow_id)
      .bind(&new.release_id)
      .bind(RunStatus::Queued)
      .bind(new.input.as_ref().map(Json))
      .bind(&new.created_by)
      .bind(Utc::now())
      .fetch_one(&self.pool)
      .await?;

    Ok(run)
  }

  async fn get_run(&self, id: &str) -> Result<Run, StoreError> {
    let query = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?");
    let run: Option<Run> = sqlx::query_as(&query).bind(id).fetch_optional(&self.pool).await?;
    run.ok_or_else(|| StoreError::RunNotFound(id.to_string()))
  }

  async fn claim_next_run(&self) -> Result<Option<Run>, StoreError> {
    // Single conditional UPDATE: the inner select picks the oldest queued
    // row, the outer status guard makes the claim atomic, so concurrent
    // claimants can never both observe the same queued row.
    let now = Utc::now();
    let query = format!(
      r#"
      UPDATE runs
      SET status = ?, started_at = ?, heartbeat_at = ?
      WHERE id = (
        SELECT id FROM runs WHERE status = ? ORDER BY created_at ASC, id ASC LIMIT 1
      )
      AND status = ?
      RETURNING {RUN_COLUMNS}
      "#
    );
    let run: Option<Run> = sqlx::query_as(&query)
      .bind(RunStatus::Running)
      .bind(now)
      .bind(now)
      .bind(RunStatus::Queued)
      .bind(RunStatus::Queued)
      .fetch_optional(&self.pool)
      .await?;

    Ok(run)
  }

  async fn finish_run(
    &self,
    run_id: &str,
    status: RunStatus,
    output: Option<Value>,
    error: Option<Value>,
  ) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      UPDATE runs
      SET status = ?,
          output = COALESCE(?, output),
          error = COALESCE(?, error),
          finished_at = ?
      WHERE id = ?
      "#,
    )
    .bind(status)
    .bind(output.as_ref().map(Json))
    .bind(error.as_ref().map(Json))
    .bind(Utc::now())
    .bind(run_id)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn cancel_run(&self, run_id: &str) -> Result<bool, StoreError> {
    let result = sqlx::query(
      "UPDATE runs SET status = ?, finished_at = ? WHERE id = ? AND status IN (?, ?)",
    )
    .bind(RunStatus::Canceled)
    .bind(Utc::now())
    .bind(run_id)
    .bind(RunStatus::Queued)
    .bind(RunStatus::Running)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() > 0)
  }

  async fn reset_stale_runs(&self, stale_before: DateTime<Utc>) -> Result<u64, StoreError> {
    let result = sqlx::query(
      r#"
      UPDATE runs
      SET status = ?, started_at = NULL, heartbeat_at = NULL
      WHERE status = ? AND heartbeat_at IS NOT NULL AND heartbeat_at < ?
      "#,
    )
    .bind(RunStatus::Queued)
    .bind(RunStatus::Running)
    .bind(stale_before)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected())
  }

  async fn heartbeat_run(&self, run_id: &str) -> Result<bool, StoreError> {
    let result = sqlx::query("UPDATE runs SET heartbeat_at = ? WHERE id = ? AND status = ?")
      .bind(Utc::now())
      .bind(run_id)
      .bind(RunStatus::Running)
      .execute(&self.pool)
      .await?;

    Ok(result.rows_affected() > 0)
  }

  async fn insert_node_task(&self, new: &NewNodeTask) -> Result<NodeTask, StoreError> {
    // run_seq is computed inside the insert statement, keeping assignment
    // transactional under SQLite's single-writer discipline.
    let query = format!(
      r#"
      INSERT INTO node_tasks (id, run_id, node_id, status, input, parent_task_id,
                              branch_id, iteration, loop_node_id, started_at, run_seq)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
              (SELECT COALESCE(MAX(run_seq), 0) + 1 FROM node_tasks WHERE run_id = ?))
      RETURNING {TASK_COLUMNS}
      "#
    );
    let task: NodeTask = sqlx::query_as(&query)
      .bind(&new.id)
      .bind(&new.run_id)
      .bind(&new.node_id)
      .bind(new.status)
      .bind(new.input.as_ref().map(Json))
      .bind(&new.parent_task_id)
      .bind(&new.branch_id)
      .bind(new.iteration)
      .bind(&new.loop_node_id)
      .bind(new.started_at)
      .bind(&new.run_id)
      .fetch_one(&self.pool)
      .await?;

    Ok(task)
  }

  async fn update_node_task(
    &self,
    task_id: &str,
    update: &NodeTaskUpdate,
  ) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      UPDATE node_tasks
      SET status = ?,
          input = COALESCE(?, input),
          output = COALESCE(?, output),
          error = COALESCE(?, error),
          metrics = COALESCE(?, metrics),
          started_at = COALESCE(?, started_at),
          finished_at = COALESCE(?, finished_at)
      WHERE id = ?
      "#,
    )
    .bind(update.status)
    .bind(update.input.as_ref().map(Json))
    .bind(update.output.as_ref().map(Json))
    .bind(update.error.as_ref().map(Json))
    .bind(update.metrics.as_ref().map(Json))
    .bind(update.started_at)
    .bind(update.finished_at)
    .bind(task_id)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn list_node_tasks(&self, run_id: &str) -> Result<Vec<NodeTask>, StoreError> {
    let query = format!("SELECT {TASK_COLUMNS} FROM node_tasks WHERE run_id = ? ORDER BY run_seq ASC");
    let tasks: Vec<NodeTask> =
      sqlx::query_as(&query).bind(run_id).fetch_all(&self.pool).await?;
    Ok(tasks)
  }

  async fn append_log(&self, new: &NewRunLog) -> Result<i64, StoreError> {
    let seq: i64 = sqlx::query_scalar(
      r#"
      INSERT INTO run_logs (id, run_id, seq, level, event, payload, node_id, created_at)
      VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM run_logs WHERE run_id = ?),
              ?, ?, ?, ?, ?)
      RETURNING seq
      "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&new.run_id)
    .bind(&new.run_id)
    .bind(new.level)
    .bind(&new.event)
    .bind(new.payload.as_ref().map(Json))
    .bind(&new.node_id)
    .bind(Utc::now())
    .fetch_one(&self.pool)
    .await?;

    Ok(seq)
  }

  async fn get_logs(
    &self,
    run_id: &str,
    after_seq: i64,
    limit: i64,
  ) -> Result<Vec<RunLog>, StoreError> {
    let logs: Vec<RunLog> = sqlx::query_as(
      r#"
      SELECT id, run_id, seq, level, event, payload, node_id, created_at
      FROM run_logs
      WHERE run_id = ? AND seq > ?
      ORDER BY seq ASC
      LIMIT ?
      "#,
    )
    .bind(run_id)
    .bind(after_seq)
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;

    Ok(logs)
  }

  async fn put_checkpoint(&self, run_id: &str, state: &Value) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO run_checkpoints (run_id, state, updated_at)
      VALUES (?, ?, ?)
      ON CONFLICT (run_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
      "#,
    )
    .bind(run_id)
    .bind(Json(state))
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_checkpoint(&self, run_id: &str) -> Result<Option<Value>, StoreError> {
    let state: Option<Json<Value>> =
      sqlx::query_scalar("SELECT state FROM run_checkpoints WHERE run_id = ?")
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

    Ok(state.map(|json| json.0))
  }
}
