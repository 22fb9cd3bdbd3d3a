use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::enums::{Combinator, Comparator};
use crate::shape::OutputShape;

/// A node in the workflow graph.
///
/// `loop_id` is the loop-membership attribute: when set, this node belongs
/// to the body of the loop node with that id and is not part of the
/// top-level graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDef {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
  #[serde(flatten)]
  pub kind: NodeKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub loop_id: Option<String>,
  /// Persisted extension point; the engine does not enforce it.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_seconds: Option<u64>,
  /// Persisted extension point; the engine does not enforce it.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry_delay_seconds: Option<u64>,
}

// Loop nodes may omit `data` entirely since every loop setting has a
// default, but the adjacently tagged derive on NodeKind requires the
// content key. Deserialization goes through a raw value and fills in an
// empty object first.
impl<'de> Deserialize<'de> for NodeDef {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    #[derive(Deserialize)]
    struct Wire {
      id: String,
      #[serde(default)]
      label: Option<String>,
      #[serde(flatten)]
      kind: NodeKind,
      #[serde(default)]
      loop_id: Option<String>,
      #[serde(default)]
      timeout_seconds: Option<u64>,
      #[serde(default)]
      retry_delay_seconds: Option<u64>,
    }

    let mut raw = Value::deserialize(deserializer)?;
    if let Value::Object(map) = &mut raw
      && map.get("type").and_then(Value::as_str) == Some("loop")
      && !map.contains_key("data")
    {
      map.insert("data".to_string(), Value::Object(serde_json::Map::new()));
    }
    let wire = Wire::deserialize(raw).map_err(serde::de::Error::custom)?;
    Ok(NodeDef {
      id: wire.id,
      label: wire.label,
      kind: wire.kind,
      loop_id: wire.loop_id,
      timeout_seconds: wire.timeout_seconds,
      retry_delay_seconds: wire.retry_delay_seconds,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NodeKind {
  /// Entry node; receives the run input.
  Start,
  /// Terminal node; collects direct upstream outputs.
  End,
  /// Model invocation through an opaque capability.
  Llm {
    capability: String,
    prompt: String,
    #[serde(default)]
    params: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_shape: Option<OutputShape>,
  },
  /// Tool invocation through an opaque capability.
  Tool {
    capability: String,
    #[serde(default)]
    params: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_shape: Option<OutputShape>,
  },
  /// Boolean predicate; routes via the "true"/"false" outgoing edges.
  Condition { condition: ConditionDef },
  /// Loop over a body sub-graph identified by `loop_id` attributes.
  Loop {
    #[serde(default)]
    settings: LoopSettings,
  },
}

impl NodeKind {
  /// Short name used in logs and error messages.
  pub fn name(&self) -> &'static str {
    match self {
      NodeKind::Start => "start",
      NodeKind::End => "end",
      NodeKind::Llm { .. } => "llm",
      NodeKind::Tool { .. } => "tool",
      NodeKind::Condition { .. } => "condition",
      NodeKind::Loop { .. } => "loop",
    }
  }
}

/// Predicate of a condition node.
///
/// `left` is a template string resolved against node outputs before the
/// comparison; `right` is a literal JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionDef {
  pub left: String,
  pub comparator: Comparator,
  pub right: Value,
}

/// A single break condition of a loop node.
///
/// `field` is a label-or-id-prefixed dot path looked up in the current
/// iteration's body outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakCondition {
  pub field: String,
  pub comparator: Comparator,
  pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoopSettings {
  /// Iteration cap; the engine default applies when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_iterations: Option<u32>,
  #[serde(default)]
  pub break_conditions: Vec<BreakCondition>,
  #[serde(default)]
  pub combinator: Combinator,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_node_def_roundtrip() {
    let raw = json!({
      "id": "score",
      "label": "Scorer",
      "type": "llm",
      "data": {
        "capability": "chat",
        "prompt": "Rate {{Reader.text}} from 1 to 10",
        "output_shape": {
          "kind": "array",
          "fields": [{ "name": "score", "type": "Integer" }]
        }
      },
      "loop_id": "refine"
    });

    let node: NodeDef = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(node.id, "score");
    assert_eq!(node.loop_id.as_deref(), Some("refine"));
    assert!(matches!(node.kind, NodeKind::Llm { .. }));

    let back = serde_json::to_value(&node).unwrap();
    let reparsed: NodeDef = serde_json::from_value(back).unwrap();
    assert_eq!(reparsed, node);
  }

  #[test]
  fn test_start_node_without_data() {
    let node: NodeDef = serde_json::from_value(json!({ "id": "s", "type": "start" })).unwrap();
    assert!(matches!(node.kind, NodeKind::Start));
    assert_eq!(node.kind.name(), "start");
  }

  #[test]
  fn test_loop_node_without_data() {
    let node: NodeDef = serde_json::from_value(json!({ "id": "refine", "type": "loop" })).unwrap();
    let NodeKind::Loop { settings } = &node.kind else {
      panic!("expected a loop node");
    };
    assert_eq!(settings.max_iterations, None);
    assert!(settings.break_conditions.is_empty());
  }

  #[test]
  fn test_comparator_wire_names() {
    let c: Comparator = serde_json::from_value(json!(">=")).unwrap();
    assert_eq!(c, Comparator::Gte);
    assert_eq!(serde_json::to_value(Comparator::NotContains).unwrap(), json!("not_contains"));
  }
}
