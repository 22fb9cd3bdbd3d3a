//! Larkspur Store
//!
//! Repository over the relational store for the three persisted execution
//! entities (Run, NodeTask, RunLog) plus releases and checkpoints. The
//! store is the only shared mutable resource between worker processes;
//! every status transition is a single-row statement, and the per-run
//! `seq`/`run_seq` counters are assigned inside the insert statement so
//! they stay strictly increasing even with concurrent writers.

mod sqlite;
mod types;

use std::future::Future;

use chrono::{DateTime, Utc};
use larkspur_config::Release;
use serde_json::Value;
use thiserror::Error;

pub use sqlite::SqliteStore;
pub use types::{
  LogLevel, NewNodeTask, NewRun, NewRunLog, NodeTask, NodeTaskUpdate, Run, RunLog, RunStatus,
  TaskStatus,
};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  #[error("run not found: {0}")]
  RunNotFound(String),

  #[error("release not found: {0}")]
  ReleaseNotFound(String),

  #[error("invalid stored payload: {0}")]
  Payload(#[from] serde_json::Error),
}

/// Storage operations for runs, node tasks and run logs.
pub trait Store: Send + Sync {
  /// Persist an immutable release.
  fn create_release(
    &self,
    release: &Release,
  ) -> impl Future<Output = Result<(), StoreError>> + Send;

  /// Get a release by id.
  fn get_release(&self, id: &str) -> impl Future<Output = Result<Release, StoreError>> + Send;

  /// Enqueue a new run (status `queued`).
  fn create_run(&self, new: &NewRun) -> impl Future<Output = Result<Run, StoreError>> + Send;

  /// Get a run by id.
  fn get_run(&self, id: &str) -> impl Future<Output = Result<Run, StoreError>> + Send;

  /// Atomically claim the oldest queued run and transition it to `running`.
  ///
  /// This is the claim: at most one caller observes any given queued row,
  /// so two workers can never execute the same run.
  fn claim_next_run(&self) -> impl Future<Output = Result<Option<Run>, StoreError>> + Send;

  /// Persist a terminal run status with output or error envelope.
  fn finish_run(
    &self,
    run_id: &str,
    status: RunStatus,
    output: Option<Value>,
    error: Option<Value>,
  ) -> impl Future<Output = Result<(), StoreError>> + Send;

  /// Cancel a run; only queued or running runs can be canceled.
  /// Returns whether a row was transitioned.
  fn cancel_run(&self, run_id: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

  /// Reset running runs whose heartbeat is older than `stale_before` back
  /// to `queued`. Node task rows are left untouched. Returns the number of
  /// runs reset.
  fn reset_stale_runs(
    &self,
    stale_before: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, StoreError>> + Send;

  /// Refresh the heartbeat of a running run. Returns whether the run was
  /// still in `running`.
  fn heartbeat_run(&self, run_id: &str)
  -> impl Future<Output = Result<bool, StoreError>> + Send;

  /// Insert a node task row, assigning the next `run_seq` for its run.
  fn insert_node_task(
    &self,
    new: &NewNodeTask,
  ) -> impl Future<Output = Result<NodeTask, StoreError>> + Send;

  /// Apply a partial update to a node task row.
  fn update_node_task(
    &self,
    task_id: &str,
    update: &NodeTaskUpdate,
  ) -> impl Future<Output = Result<(), StoreError>> + Send;

  /// All node tasks of a run, in `run_seq` order.
  fn list_node_tasks(
    &self,
    run_id: &str,
  ) -> impl Future<Output = Result<Vec<NodeTask>, StoreError>> + Send;

  /// Append a log record, assigning the next `seq` for its run.
  /// Returns the assigned seq.
  fn append_log(&self, new: &NewRunLog)
  -> impl Future<Output = Result<i64, StoreError>> + Send;

  /// Logs of a run with `seq > after_seq`, ordered by seq, at most `limit`.
  fn get_logs(
    &self,
    run_id: &str,
    after_seq: i64,
    limit: i64,
  ) -> impl Future<Output = Result<Vec<RunLog>, StoreError>> + Send;

  /// Best-effort checkpoint write, keyed by run id.
  fn put_checkpoint(
    &self,
    run_id: &str,
    state: &Value,
  ) -> impl Future<Output = Result<(), StoreError>> + Send;

  /// Best-effort checkpoint read.
  fn get_checkpoint(
    &self,
    run_id: &str,
  ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;
}
