//! Larkspur Tracker
//!
//! In-memory node-status state machine for one run, mirroring every
//! transition into the persisted journal: the NodeTask row is created
//! lazily on first observation and updated afterwards, and each transition
//! appends a matching RunLog event.
//!
//! Transitions are forward-only; an attempt to move backwards (or repeat a
//! transition) is ignored and reported as "not new", which callers use to
//! avoid duplicate external notifications.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use larkspur_store::{
  LogLevel, NewNodeTask, NewRunLog, NodeTaskUpdate, Store, StoreError, TaskStatus,
};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TrackerError {
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Node execution states. SUCCESS, ERROR, SKIPPED and CANCELLED are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
  Pending,
  Ready,
  Running,
  Success,
  Error,
  Skipped,
  Cancelled,
}

impl NodeState {
  fn rank(self) -> u8 {
    match self {
      NodeState::Pending => 0,
      NodeState::Ready => 1,
      NodeState::Running => 2,
      NodeState::Success | NodeState::Error | NodeState::Skipped | NodeState::Cancelled => 3,
    }
  }

  pub fn is_terminal(self) -> bool {
    self.rank() == 3
  }

  fn task_status(self) -> TaskStatus {
    match self {
      NodeState::Pending => TaskStatus::Pending,
      NodeState::Ready => TaskStatus::Ready,
      NodeState::Running => TaskStatus::Running,
      NodeState::Success => TaskStatus::Success,
      NodeState::Error => TaskStatus::Failed,
      NodeState::Skipped => TaskStatus::Skipped,
      NodeState::Cancelled => TaskStatus::Cancelled,
    }
  }

  fn from_task_status(status: TaskStatus) -> Self {
    match status {
      TaskStatus::Pending => NodeState::Pending,
      TaskStatus::Ready => NodeState::Ready,
      TaskStatus::Running => NodeState::Running,
      TaskStatus::Success => NodeState::Success,
      TaskStatus::Failed => NodeState::Error,
      TaskStatus::Skipped => NodeState::Skipped,
      TaskStatus::Cancelled => NodeState::Cancelled,
    }
  }

  fn log_event(self) -> &'static str {
    match self {
      NodeState::Pending => "node_pending",
      NodeState::Ready => "node_ready",
      NodeState::Running => "node_start",
      NodeState::Success => "node_end",
      NodeState::Error => "node_error",
      NodeState::Skipped => "node_skipped",
      NodeState::Cancelled => "node_cancelled",
    }
  }

  fn log_level(self) -> LogLevel {
    match self {
      NodeState::Error => LogLevel::Error,
      _ => LogLevel::Info,
    }
  }
}

/// Identity of one tracked task: a top-level node, or one iteration of a
/// loop-body node. Lineage of loop-body tasks is (loop_node_id, iteration).
#[derive(Debug, Clone)]
pub struct TaskScope {
  pub node_id: String,
  pub parent_task_id: Option<String>,
  pub branch_id: Option<String>,
  pub iteration: Option<i64>,
  pub loop_node_id: Option<String>,
}

impl TaskScope {
  pub fn node(node_id: impl Into<String>) -> Self {
    Self {
      node_id: node_id.into(),
      parent_task_id: None,
      branch_id: None,
      iteration: None,
      loop_node_id: None,
    }
  }

  pub fn loop_member(
    node_id: impl Into<String>,
    loop_node_id: impl Into<String>,
    iteration: i64,
    parent_task_id: Option<String>,
  ) -> Self {
    Self {
      node_id: node_id.into(),
      parent_task_id,
      branch_id: None,
      iteration: Some(iteration),
      loop_node_id: Some(loop_node_id.into()),
    }
  }

  /// In-memory map key: a body node re-executed every iteration gets one
  /// slot per iteration.
  fn key(&self) -> String {
    match self.iteration {
      Some(iteration) => format!("{}@{}", self.node_id, iteration),
      None => self.node_id.clone(),
    }
  }
}

#[derive(Default)]
struct TrackerState {
  status: HashMap<String, NodeState>,
  outputs: HashMap<String, Value>,
  errors: HashMap<String, String>,
  task_ids: HashMap<String, String>,
}

/// Tracks node execution state for one run and journals every transition.
pub struct RunTracker<S> {
  run_id: String,
  store: S,
  state: Mutex<TrackerState>,
}

struct Transition {
  task_id: String,
  insert: bool,
  next: NodeState,
}

impl<S: Store> RunTracker<S> {
  pub fn new(store: S, run_id: impl Into<String>) -> Self {
    Self {
      run_id: run_id.into(),
      store,
      state: Mutex::new(TrackerState::default()),
    }
  }

  pub fn run_id(&self) -> &str {
    &self.run_id
  }

  /// Rehydrate the in-memory maps from persisted NodeTask rows.
  ///
  /// Used for status queries after a process restart; it does not resume
  /// mid-run execution.
  pub async fn sync_from_store(&self) -> Result<(), TrackerError> {
    let tasks = self.store.list_node_tasks(&self.run_id).await?;
    let mut state = self.state.lock().expect("tracker state poisoned");
    *state = TrackerState::default();
    for task in tasks {
      let key = match task.iteration {
        Some(iteration) => format!("{}@{}", task.node_id, iteration),
        None => task.node_id.clone(),
      };
      state.status.insert(key.clone(), NodeState::from_task_status(task.status));
      if let Some(output) = task.output {
        state.outputs.insert(key.clone(), output.0);
      }
      if let Some(error) = task.error {
        state
          .errors
          .insert(key.clone(), error.0.get("error").and_then(Value::as_str).unwrap_or_default().to_string());
      }
      state.task_ids.insert(key, task.id);
    }
    Ok(())
  }

  pub async fn mark_ready(&self, scope: &TaskScope) -> Result<bool, TrackerError> {
    self.apply(scope, NodeState::Ready, None, None, None, None, None).await
  }

  pub async fn mark_running(
    &self,
    scope: &TaskScope,
    input: Value,
  ) -> Result<bool, TrackerError> {
    self
      .apply(scope, NodeState::Running, Some(input), None, None, None, None)
      .await
  }

  pub async fn mark_success(
    &self,
    scope: &TaskScope,
    output: Value,
    metrics: Option<Value>,
  ) -> Result<bool, TrackerError> {
    self
      .apply(scope, NodeState::Success, None, Some(output), None, metrics, None)
      .await
  }

  pub async fn mark_error(
    &self,
    scope: &TaskScope,
    message: &str,
  ) -> Result<bool, TrackerError> {
    self
      .apply(
        scope,
        NodeState::Error,
        None,
        Some(json!({ "error": message })),
        Some(message.to_string()),
        None,
        None,
      )
      .await
  }

  pub async fn mark_skipped(
    &self,
    scope: &TaskScope,
    reason: &str,
  ) -> Result<bool, TrackerError> {
    self
      .apply(scope, NodeState::Skipped, None, None, None, None, Some(reason.to_string()))
      .await
  }

  pub async fn mark_cancelled(
    &self,
    scope: &TaskScope,
    reason: &str,
  ) -> Result<bool, TrackerError> {
    self
      .apply(scope, NodeState::Cancelled, None, None, None, None, Some(reason.to_string()))
      .await
  }

  /// Current state of a task key (node id, or `node@iteration`).
  pub fn state_of(&self, scope: &TaskScope) -> NodeState {
    let state = self.state.lock().expect("tracker state poisoned");
    state.status.get(&scope.key()).copied().unwrap_or(NodeState::Pending)
  }

  /// Snapshot of recorded outputs.
  pub fn outputs(&self) -> HashMap<String, Value> {
    self.state.lock().expect("tracker state poisoned").outputs.clone()
  }

  /// Snapshot of recorded error messages.
  pub fn errors(&self) -> HashMap<String, String> {
    self.state.lock().expect("tracker state poisoned").errors.clone()
  }

  async fn apply(
    &self,
    scope: &TaskScope,
    next: NodeState,
    input: Option<Value>,
    output: Option<Value>,
    error: Option<String>,
    metrics: Option<Value>,
    reason: Option<String>,
  ) -> Result<bool, TrackerError> {
    let key = scope.key();
    // Decide under the lock, persist outside it: the lock is never held
    // across an await point.
    let transition = {
      let mut state = self.state.lock().expect("tracker state poisoned");
      let current = state.status.get(&key).copied().unwrap_or(NodeState::Pending);
      if next.rank() <= current.rank() {
        debug!(node_id = %scope.node_id, ?current, ?next, "ignoring non-forward transition");
        return Ok(false);
      }
      state.status.insert(key.clone(), next);
      if let Some(output) = &output {
        state.outputs.insert(key.clone(), output.clone());
      }
      if let Some(error) = &error {
        state.errors.insert(key.clone(), error.clone());
      }
      match state.task_ids.get(&key) {
        Some(task_id) => Transition { task_id: task_id.clone(), insert: false, next },
        None => {
          let task_id = uuid::Uuid::new_v4().to_string();
          state.task_ids.insert(key.clone(), task_id.clone());
          Transition { task_id, insert: true, next }
        }
      }
    };

    let now = Utc::now();
    let started_at = (next == NodeState::Running).then_some(now);
    let finished_at = next.is_terminal().then_some(now);
    let error_envelope = error.as_deref().map(|message| json!({ "error": message }));

    if transition.insert {
      self
        .store
        .insert_node_task(&NewNodeTask {
          id: transition.task_id.clone(),
          run_id: self.run_id.clone(),
          node_id: scope.node_id.clone(),
          status: next.task_status(),
          input: input.clone(),
          parent_task_id: scope.parent_task_id.clone(),
          branch_id: scope.branch_id.clone(),
          iteration: scope.iteration,
          loop_node_id: scope.loop_node_id.clone(),
          started_at,
        })
        .await?;
      // First observation straight into a terminal state still needs the
      // output/metrics written.
      if output.is_some() || metrics.is_some() || error_envelope.is_some() || finished_at.is_some()
      {
        self
          .store
          .update_node_task(
            &transition.task_id,
            &NodeTaskUpdate {
              status: next.task_status(),
              output: output.clone(),
              error: error_envelope.clone(),
              metrics: metrics.clone(),
              finished_at,
              ..Default::default()
            },
          )
          .await?;
      }
    } else {
      self
        .store
        .update_node_task(
          &transition.task_id,
          &NodeTaskUpdate {
            status: next.task_status(),
            input: input.clone(),
            output: output.clone(),
            error: error_envelope.clone(),
            metrics: metrics.clone(),
            started_at,
            finished_at,
          },
        )
        .await?;
    }

    let mut payload = json!({ "task_id": transition.task_id });
    if let Some(iteration) = scope.iteration {
      payload["iteration"] = json!(iteration);
      payload["loop_node_id"] = json!(scope.loop_node_id);
    }
    if let Some(message) = &error {
      payload["error"] = json!(message);
    }
    if let Some(metrics) = &metrics {
      payload["metrics"] = metrics.clone();
    }
    if let Some(reason) = &reason {
      payload["reason"] = json!(reason);
    }

    self
      .store
      .append_log(&NewRunLog {
        run_id: self.run_id.clone(),
        level: transition.next.log_level(),
        event: transition.next.log_event().to_string(),
        payload: Some(payload),
        node_id: Some(scope.node_id.clone()),
      })
      .await?;

    Ok(true)
  }
}
