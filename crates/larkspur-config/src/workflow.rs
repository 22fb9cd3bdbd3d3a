use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::edge::EdgeDef;
use crate::error::ConfigError;
use crate::node::NodeDef;

/// A declarative workflow: nodes plus directed edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
  pub nodes: Vec<NodeDef>,
  pub edges: Vec<EdgeDef>,
}

impl WorkflowDef {
  /// Parse a workflow definition from JSON text.
  pub fn from_json(text: &str) -> Result<Self, ConfigError> {
    let def: WorkflowDef = serde_json::from_str(text)?;
    def.check_references()?;
    Ok(def)
  }

  /// Get a node by id.
  pub fn node(&self, id: &str) -> Option<&NodeDef> {
    self.nodes.iter().find(|n| n.id == id)
  }

  /// Map of node id to label, for nodes that carry one.
  pub fn labels(&self) -> HashMap<String, String> {
    self
      .nodes
      .iter()
      .filter_map(|n| n.label.as_ref().map(|l| (n.id.clone(), l.clone())))
      .collect()
  }

  /// Structural checks that do not need the capability registry: unique node
  /// ids and edges pointing at known nodes. Everything else is the
  /// compiler's job.
  pub fn check_references(&self) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for node in &self.nodes {
      if !seen.insert(node.id.as_str()) {
        return Err(ConfigError::DuplicateNode(node.id.clone()));
      }
    }
    for edge in &self.edges {
      if !seen.contains(edge.source.as_str()) || !seen.contains(edge.target.as_str()) {
        return Err(ConfigError::InvalidEdge {
          edge_source: edge.source.clone(),
          target: edge.target.clone(),
        });
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn minimal_def() -> serde_json::Value {
    json!({
      "nodes": [
        { "id": "a", "type": "start" },
        { "id": "b", "type": "end" }
      ],
      "edges": [
        { "id": "e1", "source": "a", "target": "b" }
      ]
    })
  }

  #[test]
  fn test_from_json_ok() {
    let def = WorkflowDef::from_json(&minimal_def().to_string()).unwrap();
    assert_eq!(def.nodes.len(), 2);
    assert!(def.node("a").is_some());
    assert!(def.node("missing").is_none());
  }

  #[test]
  fn test_duplicate_node_rejected() {
    let mut raw = minimal_def();
    raw["nodes"].as_array_mut().unwrap().push(json!({ "id": "a", "type": "end" }));
    let err = WorkflowDef::from_json(&raw.to_string()).unwrap_err();
    assert!(matches!(err, ConfigError::DuplicateNode(id) if id == "a"));
  }

  #[test]
  fn test_dangling_edge_rejected() {
    let mut raw = minimal_def();
    raw["edges"]
      .as_array_mut()
      .unwrap()
      .push(json!({ "id": "e2", "source": "a", "target": "ghost" }));
    let err = WorkflowDef::from_json(&raw.to_string()).unwrap_err();
    assert!(matches!(
      err,
      ConfigError::InvalidEdge { edge_source, target } if edge_source == "a" && target == "ghost"
    ));
  }
}
