//! Larkspur Worker
//!
//! Polls the store for queued runs, claims them one at a time and hands
//! them to the run executor. Any number of worker processes can share one
//! queue: coordination happens exclusively through the store's atomic
//! claim, and a separate heartbeat task keeps the owned run's lease fresh
//! so other workers can tell a dead owner from a slow one. Each poll tick
//! also sweeps runs whose heartbeat went stale back into the queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use larkspur_capability::CapabilityRegistry;
use larkspur_engine::RunExecutor;
use larkspur_store::{NewRun, Run, Store, StoreError};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker timing knobs.
///
/// The heartbeat interval must stay well under the stale timeout, otherwise
/// a healthy worker's runs get reclaimed from under it.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub poll_interval: Duration,
  pub heartbeat_interval: Duration,
  pub stale_timeout: Duration,
  pub worker_id: String,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(1),
      heartbeat_interval: Duration::from_secs(30),
      stale_timeout: Duration::from_secs(300),
      worker_id: uuid::Uuid::new_v4().to_string(),
    }
  }
}

/// A single-claim queue worker.
pub struct QueueWorker<S> {
  store: S,
  executor: RunExecutor<S>,
  config: WorkerConfig,
  notify: Arc<Notify>,
  current_run: Arc<Mutex<Option<String>>>,
}

impl<S: Store + Clone + Send + Sync + 'static> QueueWorker<S> {
  pub fn new(store: S, registry: Arc<CapabilityRegistry>, config: WorkerConfig) -> Self {
    Self {
      executor: RunExecutor::new(store.clone(), registry),
      store,
      config,
      notify: Arc::new(Notify::new()),
      current_run: Arc::new(Mutex::new(None)),
    }
  }

  /// Handle for waking this worker from another task in the same process.
  pub fn notifier(&self) -> Arc<Notify> {
    self.notify.clone()
  }

  /// Enqueue a run and wake the worker immediately, skipping the poll
  /// interval.
  pub async fn enqueue(&self, new: &NewRun) -> Result<Run, StoreError> {
    let run = self.store.create_run(new).await?;
    info!(run_id = %run.id, workflow_id = %run.workflow_id, "run enqueued");
    self.notify.notify_one();
    Ok(run)
  }

  /// Run the worker until the token is cancelled.
  ///
  /// Store errors at a tick are transient: they are logged and retried on
  /// the next tick, never surfaced into run state.
  pub async fn run(&self, cancel: CancellationToken) {
    info!(worker_id = %self.config.worker_id, "worker started");
    let heartbeat = tokio::spawn(heartbeat_loop(
      self.store.clone(),
      self.current_run.clone(),
      self.config.heartbeat_interval,
      cancel.clone(),
    ));

    loop {
      if cancel.is_cancelled() {
        break;
      }
      match self.tick(&cancel).await {
        // A claim succeeded; poll again immediately in case more runs wait.
        Ok(true) => continue,
        Ok(false) => {}
        Err(err) => warn!(error = %err, "worker tick failed, retrying next tick"),
      }
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(self.config.poll_interval) => {}
        _ = self.notify.notified() => {}
      }
    }

    let _ = heartbeat.await;
    info!(worker_id = %self.config.worker_id, "worker stopped");
  }

  /// One poll tick: sweep stale runs, then claim and execute at most one
  /// queued run. Returns whether a run was claimed.
  async fn tick(&self, cancel: &CancellationToken) -> Result<bool, StoreError> {
    let stale = chrono::Duration::from_std(self.config.stale_timeout)
      .unwrap_or_else(|_| chrono::Duration::seconds(300));
    let reset = self.store.reset_stale_runs(Utc::now() - stale).await?;
    if reset > 0 {
      info!(reset, "requeued stale runs");
    }

    let Some(run) = self.store.claim_next_run().await? else {
      return Ok(false);
    };
    info!(run_id = %run.id, worker_id = %self.config.worker_id, "claimed run");

    // Each run gets a child token: a cancelled run must not stop the
    // worker, while worker shutdown still reaches the run.
    let run_cancel = cancel.child_token();
    *self.current_run.lock().expect("current run lock") = Some(run.id.clone());
    let result = self.executor.execute(&run, &run_cancel).await;
    *self.current_run.lock().expect("current run lock") = None;

    match result {
      Ok(status) => info!(run_id = %run.id, ?status, "run finished"),
      // The executor persists run failures itself; an error here means the
      // store went away mid-run. The stale sweep will requeue the run.
      Err(err) => warn!(run_id = %run.id, error = %err, "run execution aborted"),
    }
    Ok(true)
  }
}

/// Refreshes the heartbeat of whichever run this process currently owns.
///
/// Runs independently of the poll loop so a slow capability call never
/// delays the lease refresh.
async fn heartbeat_loop<S: Store>(
  store: S,
  current_run: Arc<Mutex<Option<String>>>,
  interval: Duration,
  cancel: CancellationToken,
) {
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
  loop {
    tokio::select! {
      _ = cancel.cancelled() => return,
      _ = ticker.tick() => {}
    }
    let owned = current_run.lock().expect("current run lock").clone();
    let Some(run_id) = owned else { continue };
    match store.heartbeat_run(&run_id).await {
      Ok(true) => debug!(run_id = %run_id, "heartbeat refreshed"),
      Ok(false) => debug!(run_id = %run_id, "run no longer running, heartbeat skipped"),
      Err(err) => warn!(run_id = %run_id, error = %err, "heartbeat failed"),
    }
  }
}
