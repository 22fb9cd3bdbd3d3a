//! Graph compiler: turns a declarative `WorkflowDef` into an executable
//! graph.
//!
//! Loop membership is a per-node attribute in the definition; the compiler
//! folds it into a single `loop_id -> members` index, drops body-internal
//! edges (the loop executor owns those) and rebinds edges that cross a loop
//! boundary to the owning loop node, so the top-level graph only ever sees
//! the loop node itself.

use std::collections::{BTreeSet, HashMap};

use larkspur_capability::CapabilityRegistry;
use larkspur_config::{NodeDef, NodeKind, WorkflowDef};

use crate::error::CompileError;

/// A redirected top-level edge. `branch` is set on outgoing edges of
/// condition nodes: `Some(true)` / `Some(false)` for the declared branch.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
  pub source: String,
  pub target: String,
  pub branch: Option<bool>,
}

/// The body sub-graph of one loop node.
#[derive(Debug, Clone, Default)]
pub struct LoopBody {
  pub members: BTreeSet<String>,
  pub nodes: HashMap<String, NodeDef>,
  pub edges: Vec<(String, String)>,
  /// Body nodes with no in-body predecessor.
  pub entries: Vec<String>,
  /// Body nodes with no in-body successor.
  pub exits: Vec<String>,
}

/// Executable form of a workflow: top-level nodes and redirected edges,
/// plus one [`LoopBody`] per loop node.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
  pub start_id: String,
  pub end_id: String,
  nodes: HashMap<String, NodeDef>,
  edges: Vec<GraphEdge>,
  loops: HashMap<String, LoopBody>,
  labels: HashMap<String, String>,
}

impl CompiledGraph {
  pub fn node(&self, id: &str) -> Option<&NodeDef> {
    self.nodes.get(id)
  }

  /// Top-level node ids, in no particular order.
  pub fn node_ids(&self) -> impl Iterator<Item = &str> {
    self.nodes.keys().map(String::as_str)
  }

  pub fn edges(&self) -> &[GraphEdge] {
    &self.edges
  }

  pub fn incoming(&self, id: &str) -> impl Iterator<Item = &GraphEdge> {
    self.edges.iter().filter(move |e| e.target == id)
  }

  pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &GraphEdge> {
    self.edges.iter().filter(move |e| e.source == id)
  }

  pub fn loop_body(&self, loop_id: &str) -> Option<&LoopBody> {
    self.loops.get(loop_id)
  }

  pub fn labels(&self) -> &HashMap<String, String> {
    &self.labels
  }
}

/// Compile a workflow definition against a capability registry.
///
/// Compilation is pure: the same definition and registry contents always
/// yield the same graph shape.
pub fn compile(
  def: &WorkflowDef,
  registry: &CapabilityRegistry,
) -> Result<CompiledGraph, CompileError> {
  def.check_references()?;

  let starts: Vec<&NodeDef> =
    def.nodes.iter().filter(|n| matches!(n.kind, NodeKind::Start)).collect();
  let ends: Vec<&NodeDef> =
    def.nodes.iter().filter(|n| matches!(n.kind, NodeKind::End)).collect();
  match starts.len() {
    0 => return Err(CompileError::MissingStart),
    1 => {}
    n => return Err(CompileError::MultipleStart(n)),
  }
  match ends.len() {
    0 => return Err(CompileError::MissingEnd),
    1 => {}
    n => return Err(CompileError::MultipleEnd(n)),
  }
  let start_id = starts[0].id.clone();
  let end_id = ends[0].id.clone();

  for node in &def.nodes {
    if let NodeKind::Llm { capability, .. } | NodeKind::Tool { capability, .. } = &node.kind
      && !registry.contains(capability)
    {
      return Err(CompileError::UnknownCapability {
        node_id: node.id.clone(),
        name: capability.clone(),
      });
    }
  }

  // Loop-membership index, built once.
  let mut loops: HashMap<String, LoopBody> = def
    .nodes
    .iter()
    .filter(|n| matches!(n.kind, NodeKind::Loop { .. }))
    .map(|n| (n.id.clone(), LoopBody::default()))
    .collect();

  for node in &def.nodes {
    let Some(loop_id) = &node.loop_id else { continue };
    if node.id == *loop_id {
      return Err(CompileError::SelfLoop { node_id: node.id.clone() });
    }
    if !matches!(
      node.kind,
      NodeKind::Llm { .. } | NodeKind::Tool { .. } | NodeKind::Condition { .. }
    ) {
      return Err(CompileError::UnsupportedBodyNode {
        node_id: node.id.clone(),
        kind: node.kind.name(),
      });
    }
    let Some(body) = loops.get_mut(loop_id) else {
      return Err(CompileError::DanglingLoop {
        node_id: node.id.clone(),
        loop_id: loop_id.clone(),
      });
    };
    body.members.insert(node.id.clone());
    body.nodes.insert(node.id.clone(), node.clone());
  }

  // Owner of a node for edge redirection: body nodes are represented by
  // their loop node at the top level.
  let owner = |id: &str| -> String {
    def
      .node(id)
      .and_then(|n| n.loop_id.clone())
      .unwrap_or_else(|| id.to_string())
  };

  let mut edges = Vec::new();
  for edge in &def.edges {
    let source_owner = owner(&edge.source);
    let target_owner = owner(&edge.target);

    // Body-local edges stay inside the loop body.
    if source_owner == target_owner && source_owner != edge.source {
      if let Some(body) = loops.get_mut(&source_owner) {
        body.edges.push((edge.source.clone(), edge.target.clone()));
      }
      continue;
    }
    // An edge collapsing onto a single node after redirection carries no
    // top-level information.
    if source_owner == target_owner {
      continue;
    }

    let branch = match def.node(&source_owner).map(|n| &n.kind) {
      Some(NodeKind::Condition { .. }) => match edge.condition.as_deref() {
        Some("true") => Some(true),
        Some("false") => Some(false),
        _ => None,
      },
      _ => None,
    };
    edges.push(GraphEdge { source: source_owner, target: target_owner, branch });
  }

  for body in loops.values_mut() {
    body.entries = body
      .members
      .iter()
      .filter(|id| !body.edges.iter().any(|(_, target)| target == *id))
      .cloned()
      .collect();
    body.exits = body
      .members
      .iter()
      .filter(|id| !body.edges.iter().any(|(source, _)| source == *id))
      .cloned()
      .collect();
  }

  let nodes: HashMap<String, NodeDef> = def
    .nodes
    .iter()
    .filter(|n| n.loop_id.is_none())
    .map(|n| (n.id.clone(), n.clone()))
    .collect();

  Ok(CompiledGraph {
    start_id,
    end_id,
    nodes,
    edges,
    loops,
    labels: def.labels(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use larkspur_capability::EchoCapability;
  use serde_json::json;
  use std::sync::Arc;

  fn registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register("echo", Arc::new(EchoCapability));
    registry
  }

  fn def(raw: serde_json::Value) -> WorkflowDef {
    serde_json::from_value(raw).unwrap()
  }

  #[test]
  fn test_requires_single_start_and_end() {
    let missing = def(json!({
      "nodes": [{ "id": "e", "type": "end" }],
      "edges": []
    }));
    assert!(matches!(compile(&missing, &registry()), Err(CompileError::MissingStart)));

    let doubled = def(json!({
      "nodes": [
        { "id": "s1", "type": "start" },
        { "id": "s2", "type": "start" },
        { "id": "e", "type": "end" }
      ],
      "edges": []
    }));
    assert!(matches!(compile(&doubled, &registry()), Err(CompileError::MultipleStart(2))));
  }

  #[test]
  fn test_unknown_capability_rejected() {
    let wf = def(json!({
      "nodes": [
        { "id": "s", "type": "start" },
        { "id": "t", "type": "tool", "data": { "capability": "nope" } },
        { "id": "e", "type": "end" }
      ],
      "edges": [
        { "id": "e1", "source": "s", "target": "t" },
        { "id": "e2", "source": "t", "target": "e" }
      ]
    }));
    let err = compile(&wf, &registry()).unwrap_err();
    assert!(matches!(err, CompileError::UnknownCapability { name, .. } if name == "nope"));
  }

  #[test]
  fn test_loop_edges_redirected_and_body_extracted() {
    let wf = def(json!({
      "nodes": [
        { "id": "s", "type": "start" },
        { "id": "gen", "type": "tool", "data": { "capability": "echo" } },
        { "id": "refine", "type": "loop" },
        { "id": "score", "type": "llm",
          "data": { "capability": "echo", "prompt": "p" }, "loop_id": "refine" },
        { "id": "filter", "type": "tool",
          "data": { "capability": "echo" }, "loop_id": "refine" },
        { "id": "e", "type": "end" }
      ],
      "edges": [
        { "id": "e1", "source": "s", "target": "gen" },
        { "id": "e2", "source": "gen", "target": "score" },
        { "id": "e3", "source": "score", "target": "filter" },
        { "id": "e4", "source": "filter", "target": "e" }
      ]
    }));
    let graph = compile(&wf, &registry()).unwrap();

    // Boundary-crossing edges rebound to the loop node.
    let tops: Vec<(&str, &str)> =
      graph.edges().iter().map(|e| (e.source.as_str(), e.target.as_str())).collect();
    assert!(tops.contains(&("gen", "refine")));
    assert!(tops.contains(&("refine", "e")));
    assert!(!tops.iter().any(|(s, t)| *s == "score" || *t == "score"));

    let body = graph.loop_body("refine").unwrap();
    assert_eq!(body.edges, vec![("score".to_string(), "filter".to_string())]);
    assert_eq!(body.entries, vec!["score"]);
    assert_eq!(body.exits, vec!["filter"]);
  }

  #[test]
  fn test_dangling_loop_reference() {
    let wf = def(json!({
      "nodes": [
        { "id": "s", "type": "start" },
        { "id": "x", "type": "tool", "data": { "capability": "echo" }, "loop_id": "ghost-loop" },
        { "id": "ghost-loop", "type": "tool", "data": { "capability": "echo" } },
        { "id": "e", "type": "end" }
      ],
      "edges": []
    }));
    // `ghost-loop` exists but is not a loop node.
    let err = compile(&wf, &registry()).unwrap_err();
    assert!(matches!(err, CompileError::DanglingLoop { loop_id, .. } if loop_id == "ghost-loop"));
  }

  #[test]
  fn test_condition_branch_edges() {
    let wf = def(json!({
      "nodes": [
        { "id": "s", "type": "start" },
        { "id": "c", "type": "condition",
          "data": { "condition": { "left": "{{s.input}}", "comparator": ">", "right": 3 } } },
        { "id": "a", "type": "tool", "data": { "capability": "echo" } },
        { "id": "e", "type": "end" }
      ],
      "edges": [
        { "id": "e1", "source": "s", "target": "c" },
        { "id": "e2", "source": "c", "target": "a", "condition": "true" },
        { "id": "e3", "source": "c", "target": "e", "condition": "false" },
        { "id": "e4", "source": "a", "target": "e" }
      ]
    }));
    let graph = compile(&wf, &registry()).unwrap();
    let branches: Vec<(&str, Option<bool>)> = graph
      .outgoing("c")
      .map(|e| (e.target.as_str(), e.branch))
      .collect();
    assert!(branches.contains(&("a", Some(true))));
    assert!(branches.contains(&("e", Some(false))));
  }
}
