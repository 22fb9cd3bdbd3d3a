//! Loop subgraph executor.
//!
//! Repeatedly executes a loop's body sub-DAG against a shrinking pending
//! item set until a break condition fires, the pending set drains, or the
//! iteration cap is reached. Body nodes execute in topological waves;
//! same-wave nodes run concurrently with full fan-in before break
//! conditions are evaluated.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use larkspur_config::{LoopSettings, NodeDef};
use larkspur_store::Store;
use larkspur_template::{LoopScope, lookup_reference};
use larkspur_tracker::TaskScope;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::compile::LoopBody;
use crate::context::ExecContext;
use crate::error::EngineError;
use crate::handler;
use crate::predicate;

/// Iteration cap applied when the loop settings do not declare one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Drive one loop node to completion.
///
/// `seed` is the upstream source feeding the loop: the node id whose
/// `output` field supplies the initial pending items. Without a seed (or
/// with an empty body) the loop is a 0-iteration no-op.
pub(crate) async fn run_loop<S: Store>(
  loop_node: &NodeDef,
  settings: &LoopSettings,
  body: &LoopBody,
  ctx: &ExecContext<'_, S>,
  base_outputs: &HashMap<String, Value>,
  seed: Option<(String, Vec<Value>)>,
) -> Result<Value, EngineError> {
  let Some((seed_node, seed_items)) = seed else {
    return Ok(empty_result());
  };
  if body.members.is_empty() || seed_items.is_empty() {
    return Ok(empty_result());
  }

  let cap = settings.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS).max(1);
  let mut passed: Vec<Value> = Vec::new();
  let mut pending: Vec<Value> = seed_items;
  let mut iterations = 0u32;

  for iteration in 1..=cap {
    if ctx.cancel.is_cancelled() {
      return Err(EngineError::Cancelled);
    }
    iterations = iteration;

    let scope = LoopScope {
      loop_node_id: loop_node.id.clone(),
      iteration,
      items: json!(pending),
    };

    // The iteration sees the global outputs with the seed source overlaid
    // by the current pending set, so body templates re-reading the source
    // only ever see not-yet-passed items.
    let mut iter_outputs = base_outputs.clone();
    match iter_outputs.get_mut(&seed_node) {
      Some(Value::Object(map)) => {
        map.insert("output".to_string(), json!(pending));
      }
      _ => {
        iter_outputs.insert(seed_node.clone(), json!({ "output": pending }));
      }
    }

    let candidates =
      execute_iteration(loop_node, body, ctx, &mut iter_outputs, &scope, iteration).await?;
    let candidates = candidates.unwrap_or_else(|| pending.clone());

    let break_results: Vec<bool> = settings
      .break_conditions
      .iter()
      .map(|bc| {
        let left = lookup_reference(&bc.field, &iter_outputs, ctx.labels, Some(&scope))
          .unwrap_or(Value::Null);
        predicate::evaluate(&left, bc.comparator, &bc.value)
      })
      .collect();
    let break_hit = predicate::combine(&break_results, settings.combinator);

    // The data filter derives from the first break condition: items that
    // satisfy it pass and are never re-evaluated; the rest seed the next
    // iteration.
    if let Some(first) = settings.break_conditions.first() {
      let path = item_field_path(&first.field, body, ctx.labels);
      let mut next_pending = Vec::new();
      for item in candidates {
        let field = navigate_item(&item, &path);
        if predicate::evaluate(&field, first.comparator, &first.value) {
          passed.push(item);
        } else {
          next_pending.push(item);
        }
      }
      pending = next_pending;
    } else {
      pending = candidates;
    }

    debug!(
      loop_node_id = %loop_node.id,
      iteration,
      passed = passed.len(),
      pending = pending.len(),
      break_hit,
      "loop iteration finished"
    );

    if break_hit || pending.is_empty() {
      break;
    }
  }

  info!(
    loop_node_id = %loop_node.id,
    iterations,
    passed = passed.len(),
    leftover = pending.len(),
    "loop finished"
  );
  Ok(json!({
    "output": passed,
    "iterations": iterations,
    "pending_items": pending,
  }))
}

fn empty_result() -> Value {
  json!({ "output": [], "iterations": 0, "pending_items": [] })
}

/// Execute one iteration of the body in topological waves.
///
/// Returns the candidate list for partitioning: the `output` field of
/// whichever body node most recently produced one, if any. Body outputs are
/// written into `iter_outputs` as they complete.
async fn execute_iteration<S: Store>(
  loop_node: &NodeDef,
  body: &LoopBody,
  ctx: &ExecContext<'_, S>,
  iter_outputs: &mut HashMap<String, Value>,
  scope: &LoopScope,
  iteration: u32,
) -> Result<Option<Vec<Value>>, EngineError> {
  let mut executed: HashSet<String> = HashSet::new();
  let mut candidates: Option<Vec<Value>> = None;

  while executed.len() < body.members.len() {
    if ctx.cancel.is_cancelled() {
      return Err(EngineError::Cancelled);
    }

    let wave: Vec<&NodeDef> = body
      .members
      .iter()
      .filter(|id| !executed.contains(*id))
      .filter(|id| {
        body
          .edges
          .iter()
          .filter(|(_, target)| target == *id)
          .all(|(source, _)| executed.contains(source))
      })
      .filter_map(|id| body.nodes.get(id))
      .collect();
    // A cyclic body would starve here; compile guarantees DAG-ness is the
    // author's problem, so bail instead of spinning.
    if wave.is_empty() {
      break;
    }

    let outputs: &HashMap<String, Value> = iter_outputs;
    let futures = wave.iter().map(|node| async move {
      let task_scope = TaskScope::loop_member(
        node.id.clone(),
        loop_node.id.clone(),
        iteration as i64,
        None,
      );
      let outcome =
        handler::execute_tracked(node, &task_scope, ctx, outputs, Some(scope)).await?;
      Ok::<_, EngineError>((node.id.clone(), outcome))
    });

    // Full fan-in: the wave completes before any break evaluation. A failed
    // node contributes its {error} envelope without blocking siblings.
    let results = join_all(futures).await;
    for result in results {
      let (node_id, outcome) = result?;
      if let Some(output) = outcome.output.get("output") {
        candidates = Some(as_item_list(output));
      }
      iter_outputs.insert(node_id.clone(), outcome.output);
      executed.insert(node_id);
    }
  }

  Ok(candidates)
}

/// A single object wraps into a one-element list; a list passes through.
pub(crate) fn as_item_list(value: &Value) -> Vec<Value> {
  match value {
    Value::Array(items) => items.clone(),
    Value::Null => Vec::new(),
    other => vec![other.clone()],
  }
}

/// Reduce a break-condition field path to a per-item path for the data
/// filter: a leading body-node id or label is dropped, as is a leading
/// `output` segment, leaving the path inside one candidate item.
fn item_field_path(
  field: &str,
  body: &LoopBody,
  labels: &HashMap<String, String>,
) -> Vec<String> {
  let mut segments: Vec<&str> = field.split('.').map(str::trim).collect();
  if let Some(root) = segments.first() {
    let is_node_ref = body.members.contains(*root)
      || *root == "loop"
      || labels.values().any(|label| label == root);
    if is_node_ref {
      segments.remove(0);
    }
  }
  if segments.first() == Some(&"output") {
    segments.remove(0);
  }
  segments.into_iter().map(str::to_string).collect()
}

fn navigate_item(item: &Value, path: &[String]) -> Value {
  let mut current = item;
  for segment in path {
    match current.get(segment) {
      Some(next) => current = next,
      None => return Value::Null,
    }
  }
  current.clone()
}
