use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

/// Status of a run. Forward-only except the stale-reset edge
/// running → queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
  Queued,
  Running,
  Success,
  Failed,
  Canceled,
}

impl RunStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, RunStatus::Success | RunStatus::Failed | RunStatus::Canceled)
  }
}

/// Status of a node task. Transitions are forward-only:
/// pending → ready → running → {success, failed, skipped, cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
  #[default]
  Pending,
  Ready,
  Running,
  Success,
  Failed,
  Skipped,
  Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum LogLevel {
  Debug,
  Info,
  Warn,
  Error,
}

/// One execution instance of a compiled workflow release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Run {
  pub id: String,
  pub workflow_id: String,
  pub release_id: String,
  pub status: RunStatus,
  pub input: Option<Json<Value>>,
  pub output: Option<Json<Value>>,
  pub error: Option<Json<Value>>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub heartbeat_at: Option<DateTime<Utc>>,
  pub created_by: Option<String>,
  pub created_at: DateTime<Utc>,
}

/// The record of one node's (or one loop iteration of one node's)
/// execution within a run.
///
/// `run_seq` is the transactionally assigned creation order within the run,
/// strictly increasing. Loop-body lineage is identified by
/// (loop_node_id, iteration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct NodeTask {
  pub id: String,
  pub run_id: String,
  pub node_id: String,
  pub status: TaskStatus,
  pub attempt: i32,
  pub input: Option<Json<Value>>,
  pub output: Option<Json<Value>>,
  pub error: Option<Json<Value>>,
  pub metrics: Option<Json<Value>>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub parent_task_id: Option<String>,
  pub branch_id: Option<String>,
  pub iteration: Option<i64>,
  pub loop_node_id: Option<String>,
  pub run_seq: i64,
}

/// An ordered, append-only event record for a run.
///
/// `seq` is unique and strictly increasing per run and is the ordering
/// primitive for incremental log polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RunLog {
  pub id: String,
  pub run_id: String,
  pub seq: i64,
  pub level: LogLevel,
  pub event: String,
  pub payload: Option<Json<Value>>,
  pub node_id: Option<String>,
  pub created_at: DateTime<Utc>,
}

/// Fields for enqueuing a new run.
#[derive(Debug, Clone)]
pub struct NewRun {
  pub workflow_id: String,
  pub release_id: String,
  pub input: Option<Value>,
  pub created_by: Option<String>,
}

/// Fields for the lazy creation of a node task row.
#[derive(Debug, Clone)]
pub struct NewNodeTask {
  pub id: String,
  pub run_id: String,
  pub node_id: String,
  pub status: TaskStatus,
  pub input: Option<Value>,
  pub parent_task_id: Option<String>,
  pub branch_id: Option<String>,
  pub iteration: Option<i64>,
  pub loop_node_id: Option<String>,
  pub started_at: Option<DateTime<Utc>>,
}

/// Partial update applied to an existing node task row.
///
/// `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct NodeTaskUpdate {
  pub status: TaskStatus,
  pub input: Option<Value>,
  pub output: Option<Value>,
  pub error: Option<Value>,
  pub metrics: Option<Value>,
  pub started_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
}

/// Fields for appending one run log record; `seq` is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewRunLog {
  pub run_id: String,
  pub level: LogLevel,
  pub event: String,
  pub payload: Option<Value>,
  pub node_id: Option<String>,
}
