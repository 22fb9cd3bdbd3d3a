//! Run executor: compiles a release and drives one run to a terminal
//! status.
//!
//! Top-level nodes execute in ready-node batches: a node is ready once
//! every incoming edge is settled (its source completed, was skipped, or
//! the edge was killed by a condition branch). All nodes of a batch run
//! concurrently; condition results kill the not-taken branch's edges and
//! nodes whose every incoming edge is dead get skipped, except the end
//! node, which always executes and collects whatever its live upstreams
//! produced.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use larkspur_capability::CapabilityRegistry;
use larkspur_config::{NodeDef, NodeKind};
use larkspur_store::{LogLevel, NewRunLog, Run, RunStatus, Store};
use larkspur_tracker::{RunTracker, TaskScope};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::compile::{CompiledGraph, compile};
use crate::context::ExecContext;
use crate::error::EngineError;
use crate::handler;
use crate::loop_exec::{as_item_list, run_loop};

pub struct RunExecutor<S> {
  store: S,
  registry: Arc<CapabilityRegistry>,
}

impl<S: Store + Clone> RunExecutor<S> {
  pub fn new(store: S, registry: Arc<CapabilityRegistry>) -> Self {
    Self { store, registry }
  }

  /// Execute a claimed run to completion and persist its terminal status.
  ///
  /// Per-node failures do not abort the run; only graph-level errors fail
  /// it. A cancelled run keeps the status the cancel request wrote.
  #[instrument(skip_all, fields(run_id = %run.id, workflow_id = %run.workflow_id))]
  pub async fn execute(
    &self,
    run: &Run,
    cancel: &tokio_util::sync::CancellationToken,
  ) -> Result<RunStatus, EngineError> {
    self
      .append_log(
        &run.id,
        LogLevel::Info,
        "workflow_start",
        json!({ "workflow_id": run.workflow_id, "release_id": run.release_id }),
      )
      .await?;

    let tracker = RunTracker::new(self.store.clone(), run.id.clone());
    match self.drive(run, &tracker, cancel).await {
      Ok(output) => {
        self
          .store
          .finish_run(&run.id, RunStatus::Success, Some(output.clone()), None)
          .await?;
        self
          .append_log(&run.id, LogLevel::Info, "workflow_end", json!({ "output": output }))
          .await?;
        info!("run succeeded");
        Ok(RunStatus::Success)
      }
      Err(EngineError::Cancelled) => {
        self
          .append_log(&run.id, LogLevel::Info, "workflow_cancelled", json!({}))
          .await?;
        info!("run cancelled");
        Ok(RunStatus::Canceled)
      }
      Err(err) => {
        let envelope = json!({ "error": err.to_string() });
        self
          .store
          .finish_run(&run.id, RunStatus::Failed, None, Some(envelope.clone()))
          .await?;
        self
          .append_log(&run.id, LogLevel::Error, "workflow_error", envelope)
          .await?;
        warn!(error = %err, "run failed");
        Ok(RunStatus::Failed)
      }
    }
  }

  async fn drive(
    &self,
    run: &Run,
    tracker: &RunTracker<S>,
    cancel: &tokio_util::sync::CancellationToken,
  ) -> Result<Value, EngineError> {
    let release = self.store.get_release(&run.release_id).await?;
    let def = release.def()?;
    let graph = compile(&def, &self.registry)?;
    let labels = graph.labels().clone();
    let ctx = ExecContext {
      run_id: &run.id,
      registry: &self.registry,
      tracker,
      labels: &labels,
      cancel,
    };
    let workflow_input = run.input.as_ref().map(|j| j.0.clone()).unwrap_or(Value::Null);

    let mut outputs: HashMap<String, Value> = HashMap::new();
    let mut skipped: HashSet<String> = HashSet::new();
    let mut dead: HashSet<usize> = HashSet::new();
    let mut batch = 0u32;

    while !outputs.contains_key(&graph.end_id) {
      // Cancellation is cooperative at batch boundaries: in-flight handlers
      // finish, but no new batch starts once the run row says cancelled.
      if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
      }
      let current = self.store.get_run(&run.id).await?;
      if current.status == RunStatus::Canceled {
        cancel.cancel();
        return Err(EngineError::Cancelled);
      }

      self
        .settle_skips(&graph, &mut skipped, &dead, &outputs, tracker)
        .await?;

      let ready = ready_nodes(&graph, &outputs, &skipped, &dead);
      if ready.is_empty() {
        return Err(EngineError::Stalled);
      }

      let snapshot = outputs.clone();
      let futures = ready.iter().map(|node| {
        execute_top_node(node, &graph, &ctx, &snapshot, &skipped, &dead, &workflow_input)
      });
      let results = join_all(futures).await;

      for result in results {
        let (node_id, output) = result?;
        // A condition result kills the other branch's edges.
        if let Some(node) = graph.node(&node_id)
          && matches!(node.kind, NodeKind::Condition { .. })
          && let Some(result) = output.get("result").and_then(Value::as_bool)
        {
          for (index, edge) in graph.edges().iter().enumerate() {
            if edge.source == node_id && edge.branch == Some(!result) {
              dead.insert(index);
            }
          }
        }
        outputs.insert(node_id, output);
      }

      batch += 1;
      let checkpoint = json!({
        "batch": batch,
        "completed": outputs.keys().collect::<Vec<_>>(),
        "skipped": skipped.iter().collect::<Vec<_>>(),
      });
      // Best-effort: a failed checkpoint write never fails the run.
      if let Err(err) = self.store.put_checkpoint(&run.id, &checkpoint).await {
        warn!(error = %err, "checkpoint write failed");
      }
    }

    Ok(outputs.get(&graph.end_id).cloned().unwrap_or_default())
  }

  /// Mark nodes whose every incoming edge is dead (or comes from a skipped
  /// node) as skipped, propagating until a fixpoint. The end node is never
  /// skipped.
  async fn settle_skips(
    &self,
    graph: &CompiledGraph,
    skipped: &mut HashSet<String>,
    dead: &HashSet<usize>,
    outputs: &HashMap<String, Value>,
    tracker: &RunTracker<S>,
  ) -> Result<(), EngineError> {
    loop {
      let mut newly_skipped = Vec::new();
      for id in graph.node_ids() {
        if outputs.contains_key(id) || skipped.contains(id) || id == graph.end_id {
          continue;
        }
        let incoming: Vec<usize> = graph
          .edges()
          .iter()
          .enumerate()
          .filter(|(_, e)| e.target == id)
          .map(|(i, _)| i)
          .collect();
        if !incoming.is_empty()
          && incoming
            .iter()
            .all(|i| dead.contains(i) || skipped.contains(&graph.edges()[*i].source))
        {
          newly_skipped.push(id.to_string());
        }
      }
      if newly_skipped.is_empty() {
        return Ok(());
      }
      for id in newly_skipped {
        tracker.mark_skipped(&TaskScope::node(&id), "branch not taken").await?;
        skipped.insert(id);
      }
    }
  }

  async fn append_log(
    &self,
    run_id: &str,
    level: LogLevel,
    event: &str,
    payload: Value,
  ) -> Result<(), EngineError> {
    self
      .store
      .append_log(&NewRunLog {
        run_id: run_id.to_string(),
        level,
        event: event.to_string(),
        payload: Some(payload),
        node_id: None,
      })
      .await?;
    Ok(())
  }
}

/// Nodes eligible for the next batch: not yet executed or skipped, with
/// every incoming edge settled and at least one live path in (the end node
/// is exempt from the live-path requirement).
fn ready_nodes<'a>(
  graph: &'a CompiledGraph,
  outputs: &HashMap<String, Value>,
  skipped: &HashSet<String>,
  dead: &HashSet<usize>,
) -> Vec<&'a NodeDef> {
  graph
    .node_ids()
    .filter(|id| !outputs.contains_key(*id) && !skipped.contains(*id))
    .filter(|id| {
      graph
        .edges()
        .iter()
        .enumerate()
        .filter(|(_, e)| e.target == *id)
        .all(|(i, e)| {
          dead.contains(&i) || skipped.contains(&e.source) || outputs.contains_key(&e.source)
        })
    })
    .filter_map(|id| graph.node(id))
    .collect()
}

/// Execute one top-level node. Start, end and loop nodes are driven here;
/// everything else goes through the shared handler.
async fn execute_top_node<S: Store>(
  node: &NodeDef,
  graph: &CompiledGraph,
  ctx: &ExecContext<'_, S>,
  outputs: &HashMap<String, Value>,
  skipped: &HashSet<String>,
  dead: &HashSet<usize>,
  workflow_input: &Value,
) -> Result<(String, Value), EngineError> {
  let scope = TaskScope::node(&node.id);
  match &node.kind {
    NodeKind::Start => {
      ctx.tracker.mark_ready(&scope).await?;
      ctx.tracker.mark_running(&scope, workflow_input.clone()).await?;
      let output = json!({ "input": start_input(workflow_input) });
      ctx.tracker.mark_success(&scope, output.clone(), None).await?;
      Ok((node.id.clone(), output))
    }
    NodeKind::End => {
      let upstream = live_upstream(graph, &node.id, outputs, skipped, dead);
      let output = Value::Object(
        upstream
          .iter()
          .filter_map(|id| outputs.get(*id).map(|v| (id.to_string(), v.clone())))
          .collect(),
      );
      ctx.tracker.mark_ready(&scope).await?;
      ctx.tracker.mark_running(&scope, output.clone()).await?;
      ctx.tracker.mark_success(&scope, output.clone(), None).await?;
      Ok((node.id.clone(), output))
    }
    NodeKind::Loop { settings } => {
      ctx.tracker.mark_ready(&scope).await?;
      let seed = loop_seed(graph, &node.id, outputs, skipped, dead);
      let seed_items = seed.as_ref().map(|(_, items)| json!(items)).unwrap_or(json!([]));
      ctx.tracker.mark_running(&scope, json!({ "items": seed_items })).await?;

      let body = graph.loop_body(&node.id).cloned().unwrap_or_default();
      match run_loop(node, settings, &body, ctx, outputs, seed).await {
        Ok(output) => {
          ctx.tracker.mark_success(&scope, output.clone(), None).await?;
          Ok((node.id.clone(), output))
        }
        Err(EngineError::Cancelled) => {
          ctx.tracker.mark_cancelled(&scope, "run cancelled").await?;
          Err(EngineError::Cancelled)
        }
        Err(err) => Err(err),
      }
    }
    _ => {
      let outcome = handler::execute_tracked(node, &scope, ctx, outputs, None).await?;
      Ok((node.id.clone(), outcome.output))
    }
  }
}

/// The start node's output field: the sole field's value when the input map
/// has exactly one field, else the whole input.
fn start_input(input: &Value) -> Value {
  match input {
    Value::Object(map) if map.len() == 1 => map.values().next().cloned().unwrap_or(Value::Null),
    other => other.clone(),
  }
}

fn live_upstream<'a>(
  graph: &'a CompiledGraph,
  id: &str,
  outputs: &HashMap<String, Value>,
  skipped: &HashSet<String>,
  dead: &HashSet<usize>,
) -> Vec<&'a str> {
  graph
    .edges()
    .iter()
    .enumerate()
    .filter(|(i, e)| {
      e.target == id
        && !dead.contains(i)
        && !skipped.contains(&e.source)
        && outputs.contains_key(&e.source)
    })
    .map(|(_, e)| e.source.as_str())
    .collect()
}

/// The loop's pending-item seed: the first live upstream output carrying an
/// `output` field. A single object wraps into a one-element list.
fn loop_seed(
  graph: &CompiledGraph,
  loop_id: &str,
  outputs: &HashMap<String, Value>,
  skipped: &HashSet<String>,
  dead: &HashSet<usize>,
) -> Option<(String, Vec<Value>)> {
  live_upstream(graph, loop_id, outputs, skipped, dead)
    .into_iter()
    .find_map(|source| {
      let field = outputs.get(source)?.get("output")?;
      if field.is_null() {
        return None;
      }
      Some((source.to_string(), as_item_list(field)))
    })
}
