//! Per-node-type handlers for llm, tool and condition nodes.
//!
//! Handlers are fail-soft: a capability failure becomes the node's output
//! `{error: message}` and is flagged on the outcome, but never raised. The
//! run is not aborted by a single failed node; downstream templates that
//! reference its fields degrade to unresolved literal text instead.

use std::collections::HashMap;

use larkspur_capability::{CapabilityRegistry, InvocationContext};
use larkspur_config::{NodeDef, NodeKind};
use larkspur_store::Store;
use larkspur_template::{LoopScope, resolve_value};
use larkspur_tracker::TaskScope;
use serde_json::{Value, json};
use tracing::warn;

use crate::coerce::coerce_output;
use crate::context::ExecContext;
use crate::error::EngineError;
use crate::predicate;

/// Result of one handler invocation.
#[derive(Debug, Clone)]
pub(crate) struct NodeOutcome {
  pub output: Value,
  pub metrics: Option<Value>,
  /// Set on capability failure; the output is the `{error}` envelope.
  pub error: Option<String>,
}

/// Resolve the templated input of a node against the current output map.
///
/// The resolved value is what gets journaled on the NodeTask before the
/// node executes.
pub(crate) fn resolve_input(
  node: &NodeDef,
  outputs: &HashMap<String, Value>,
  labels: &HashMap<String, String>,
  loop_scope: Option<&LoopScope>,
) -> Value {
  let raw = match &node.kind {
    NodeKind::Llm { prompt, params, .. } => {
      let mut raw = Value::Object(params.clone());
      raw["prompt"] = json!(prompt);
      raw
    }
    NodeKind::Tool { params, .. } => Value::Object(params.clone()),
    NodeKind::Condition { condition } => {
      json!({ "left": condition.left, "right": condition.right })
    }
    _ => return Value::Null,
  };
  let resolved = resolve_value(&raw, outputs, labels, loop_scope);
  for warning in &resolved.warnings {
    warn!(node_id = %node.id, warning, "template warning");
  }
  resolved.value
}

/// Execute a node whose input has already been resolved.
pub(crate) async fn run_resolved(
  node: &NodeDef,
  resolved: &Value,
  registry: &CapabilityRegistry,
  run_id: &str,
  outputs: &HashMap<String, Value>,
  loop_scope: Option<&LoopScope>,
) -> NodeOutcome {
  match &node.kind {
    NodeKind::Llm { capability, output_shape, .. }
    | NodeKind::Tool { capability, output_shape, .. } => {
      let ctx = InvocationContext {
        run_id: run_id.to_string(),
        node_id: node.id.clone(),
        node_outputs: outputs.clone(),
        loop_iteration: loop_scope.map(|s| s.iteration),
      };
      match registry.invoke(capability, resolved.clone(), &ctx).await {
        Ok(result) => {
          let output = match output_shape {
            Some(shape) => coerce_output(shape, &result.value),
            None => result.value,
          };
          NodeOutcome { output, metrics: result.metrics, error: None }
        }
        Err(err) => {
          let message = err.to_string();
          NodeOutcome {
            output: json!({ "error": message }),
            metrics: None,
            error: Some(message),
          }
        }
      }
    }
    NodeKind::Condition { condition } => {
      let left = resolved.get("left").cloned().unwrap_or(Value::Null);
      let result = predicate::evaluate(&left, condition.comparator, &condition.right);
      NodeOutcome { output: json!({ "result": result }), metrics: None, error: None }
    }
    // start/end/loop are driven by the executor, not by this handler.
    other => NodeOutcome {
      output: Value::Null,
      metrics: None,
      error: Some(format!("node kind '{}' has no handler", other.name())),
    },
  }
}

/// Resolve, execute and journal one node: ready → running(input) →
/// success/error. Returns the outcome; only store-level failures error.
pub(crate) async fn execute_tracked<S: Store>(
  node: &NodeDef,
  scope: &TaskScope,
  ctx: &ExecContext<'_, S>,
  outputs: &HashMap<String, Value>,
  loop_scope: Option<&LoopScope>,
) -> Result<NodeOutcome, EngineError> {
  ctx.tracker.mark_ready(scope).await?;
  let resolved = resolve_input(node, outputs, ctx.labels, loop_scope);
  ctx.tracker.mark_running(scope, resolved.clone()).await?;

  let outcome =
    run_resolved(node, &resolved, ctx.registry, ctx.run_id, outputs, loop_scope).await;
  match &outcome.error {
    None => {
      ctx
        .tracker
        .mark_success(scope, outcome.output.clone(), outcome.metrics.clone())
        .await?;
    }
    Some(message) => {
      ctx.tracker.mark_error(scope, message).await?;
    }
  }
  Ok(outcome)
}

#[cfg(test)]
mod tests {
  use super::*;
  use larkspur_capability::{EchoCapability, FailingCapability};
  use std::sync::Arc;

  fn registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register("echo", Arc::new(EchoCapability));
    registry.register("boom", Arc::new(FailingCapability { message: "no quota".into() }));
    registry
  }

  fn node(raw: serde_json::Value) -> NodeDef {
    serde_json::from_value(raw).unwrap()
  }

  #[tokio::test]
  async fn test_llm_node_resolves_prompt() {
    let node = node(json!({
      "id": "n",
      "type": "llm",
      "data": { "capability": "echo", "prompt": "summarize {{A.text}}" }
    }));
    let outputs = HashMap::from([("A".to_string(), json!({ "text": "hello" }))]);
    let resolved = resolve_input(&node, &outputs, &HashMap::new(), None);
    assert_eq!(resolved["prompt"], json!("summarize hello"));

    let outcome = run_resolved(&node, &resolved, &registry(), "r1", &outputs, None).await;
    assert!(outcome.error.is_none());
    assert_eq!(outcome.output["prompt"], json!("summarize hello"));
  }

  #[tokio::test]
  async fn test_capability_failure_is_fail_soft() {
    let node = node(json!({
      "id": "n",
      "type": "tool",
      "data": { "capability": "boom" }
    }));
    let outcome =
      run_resolved(&node, &json!({}), &registry(), "r1", &HashMap::new(), None).await;
    assert!(outcome.error.is_some());
    assert!(outcome.output["error"].as_str().unwrap().contains("no quota"));
  }

  #[tokio::test]
  async fn test_condition_node_produces_result() {
    let node = node(json!({
      "id": "c",
      "type": "condition",
      "data": { "condition": { "left": "{{A.x}}", "comparator": ">", "right": 3 } }
    }));
    let outputs = HashMap::from([("A".to_string(), json!({ "x": 5 }))]);
    let resolved = resolve_input(&node, &outputs, &HashMap::new(), None);
    assert_eq!(resolved["left"], json!(5));

    let outcome = run_resolved(&node, &resolved, &registry(), "r1", &outputs, None).await;
    assert_eq!(outcome.output, json!({ "result": true }));
  }
}
