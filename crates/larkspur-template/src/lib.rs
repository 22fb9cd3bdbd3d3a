//! Larkspur Template
//!
//! Resolves `{{X.Y...}}` references in node parameters against the outputs
//! of already-executed nodes. `X` is a node id or a node label; `Y...` is a
//! dot path into that node's output.
//!
//! Resolution is fail-soft by design: an unresolved reference is left
//! verbatim in the output text and recorded as a warning, never an error.
//! A node downstream of a failed node therefore sees literal template text
//! instead of data, which is the deliberate cascading-failure behavior of
//! the engine.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::warn;

static TEMPLATE_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("template regex"));

static AUTO_LABEL_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^label_\d+$").expect("auto label regex"));

/// Loop-local context made available to templates inside a loop body.
///
/// Referenced as `{{loop.items}}` / `{{loop.iteration}}`.
#[derive(Debug, Clone)]
pub struct LoopScope {
  pub loop_node_id: String,
  pub iteration: u32,
  /// The pending item list for the current iteration.
  pub items: Value,
}

impl LoopScope {
  fn as_value(&self) -> Value {
    serde_json::json!({
      "items": self.items,
      "iteration": self.iteration,
    })
  }
}

/// Result of resolving a template string.
#[derive(Debug, Clone)]
pub struct Resolution {
  pub text: String,
  pub warnings: Vec<String>,
}

/// Result of resolving a JSON value tree.
#[derive(Debug, Clone)]
pub struct ResolvedValue {
  pub value: Value,
  pub warnings: Vec<String>,
}

/// Resolve every `{{...}}` reference in `text`.
///
/// Lookup order for the root segment `X`:
/// 1. `loop` when a [`LoopScope`] is present;
/// 2. exact node-id match in `node_outputs`;
/// 3. label match in `node_labels` (exact, or prefix match for
///    auto-numbered `label_<n>` references).
///
/// Non-string values substitute as compact JSON text.
pub fn resolve(
  text: &str,
  node_outputs: &HashMap<String, Value>,
  node_labels: &HashMap<String, String>,
  loop_scope: Option<&LoopScope>,
) -> Resolution {
  let mut warnings = Vec::new();
  let resolved = TEMPLATE_RE.replace_all(text, |caps: &Captures<'_>| {
    let reference = caps[1].trim();
    match lookup_reference(reference, node_outputs, node_labels, loop_scope) {
      Some(value) => value_to_text(&value),
      None => {
        let verbatim = caps[0].to_string();
        warn!(reference, "unresolved template reference");
        warnings.push(format!("unresolved reference: {reference}"));
        verbatim
      }
    }
  });
  Resolution {
    text: resolved.into_owned(),
    warnings,
  }
}

/// Resolve templates in every string leaf of a JSON value tree.
///
/// A string that is exactly one template reference resolves to the
/// referenced value itself (keeping lists and objects structured); strings
/// with surrounding text go through plain text substitution.
pub fn resolve_value(
  value: &Value,
  node_outputs: &HashMap<String, Value>,
  node_labels: &HashMap<String, String>,
  loop_scope: Option<&LoopScope>,
) -> ResolvedValue {
  let mut warnings = Vec::new();
  let value = resolve_value_inner(value, node_outputs, node_labels, loop_scope, &mut warnings);
  ResolvedValue { value, warnings }
}

/// Look up a dotted `X.Y...` reference directly, without text substitution.
///
/// Used by the loop executor for break-condition field paths.
pub fn lookup_reference(
  reference: &str,
  node_outputs: &HashMap<String, Value>,
  node_labels: &HashMap<String, String>,
  loop_scope: Option<&LoopScope>,
) -> Option<Value> {
  let mut segments = reference.split('.');
  let root = segments.next()?.trim();
  let path: Vec<&str> = segments.map(str::trim).collect();

  let root_value = lookup_root(root, node_outputs, node_labels, loop_scope)?;
  navigate(&root_value, &path)
}

fn lookup_root(
  root: &str,
  node_outputs: &HashMap<String, Value>,
  node_labels: &HashMap<String, String>,
  loop_scope: Option<&LoopScope>,
) -> Option<Value> {
  if let Some(scope) = loop_scope
    && root == "loop"
  {
    return Some(scope.as_value());
  }
  if let Some(value) = node_outputs.get(root) {
    return Some(value.clone());
  }
  // Label match: exact first, then `label_<n>` prefix against auto-numbered
  // labels that carry a human-readable suffix.
  let by_label = node_labels
    .iter()
    .find(|(_, label)| label.as_str() == root)
    .or_else(|| {
      if AUTO_LABEL_RE.is_match(root) {
        node_labels.iter().find(|(_, label)| label.starts_with(root))
      } else {
        None
      }
    });
  by_label.and_then(|(node_id, _)| node_outputs.get(node_id).cloned())
}

/// Walk `path` through nested maps and lists.
///
/// A list is returned as-is when the path ends at it, or projected
/// element-wise when the path continues past it (missing elements project
/// to null).
fn navigate(value: &Value, path: &[&str]) -> Option<Value> {
  let Some((head, rest)) = path.split_first() else {
    return Some(value.clone());
  };
  match value {
    Value::Object(map) => map.get(*head).and_then(|v| navigate(v, rest)),
    Value::Array(items) => Some(Value::Array(
      items
        .iter()
        .map(|item| navigate(item, path).unwrap_or(Value::Null))
        .collect(),
    )),
    _ => None,
  }
}

fn resolve_value_inner(
  value: &Value,
  node_outputs: &HashMap<String, Value>,
  node_labels: &HashMap<String, String>,
  loop_scope: Option<&LoopScope>,
  warnings: &mut Vec<String>,
) -> Value {
  match value {
    Value::String(text) => {
      if let Some(reference) = as_pure_template(text)
        && let Some(resolved) =
          lookup_reference(reference, node_outputs, node_labels, loop_scope)
      {
        return resolved;
      }
      let resolution = resolve(text, node_outputs, node_labels, loop_scope);
      warnings.extend(resolution.warnings);
      Value::String(resolution.text)
    }
    Value::Array(items) => Value::Array(
      items
        .iter()
        .map(|item| resolve_value_inner(item, node_outputs, node_labels, loop_scope, warnings))
        .collect(),
    ),
    Value::Object(map) => Value::Object(
      map
        .iter()
        .map(|(key, item)| {
          (
            key.clone(),
            resolve_value_inner(item, node_outputs, node_labels, loop_scope, warnings),
          )
        })
        .collect(),
    ),
    other => other.clone(),
  }
}

/// Whether the string is exactly one `{{...}}` reference.
fn as_pure_template(text: &str) -> Option<&str> {
  let trimmed = text.trim();
  let caps = TEMPLATE_RE.captures(trimmed)?;
  if caps.get(0).map(|m| m.as_str()) == Some(trimmed) {
    Some(caps.get(1).map(|m| m.as_str().trim())?)
  } else {
    None
  }
}

fn value_to_text(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => serde_json::to_string(other).unwrap_or_default(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn outputs() -> HashMap<String, Value> {
    HashMap::from([
      ("A".to_string(), json!({ "text": "hi" })),
      (
        "B".to_string(),
        json!({ "items": [{ "score": 9 }, { "score": 5 }] }),
      ),
    ])
  }

  fn labels() -> HashMap<String, String> {
    HashMap::from([("A".to_string(), "Greeter".to_string())])
  }

  #[test]
  fn test_resolves_by_node_id() {
    let r = resolve("say {{A.text}}!", &outputs(), &labels(), None);
    assert_eq!(r.text, "say hi!");
    assert!(r.warnings.is_empty());
  }

  #[test]
  fn test_resolves_by_label() {
    let r = resolve("{{Greeter.text}}", &outputs(), &labels(), None);
    assert_eq!(r.text, "hi");
  }

  #[test]
  fn test_auto_label_prefix_match() {
    let labels = HashMap::from([("A".to_string(), "label_3 Summarizer".to_string())]);
    let r = resolve("{{label_3.text}}", &outputs(), &labels, None);
    assert_eq!(r.text, "hi");
  }

  #[test]
  fn test_unresolved_left_verbatim_with_warning() {
    let r = resolve("{{Missing.text}}", &outputs(), &labels(), None);
    assert_eq!(r.text, "{{Missing.text}}");
    assert_eq!(r.warnings.len(), 1);
  }

  #[test]
  fn test_list_returned_as_is() {
    let r = resolve("{{B.items}}", &outputs(), &labels(), None);
    assert_eq!(r.text, r#"[{"score":9},{"score":5}]"#);
  }

  #[test]
  fn test_list_projected_past_path() {
    let r = resolve("{{B.items.score}}", &outputs(), &labels(), None);
    assert_eq!(r.text, "[9,5]");
  }

  #[test]
  fn test_non_string_serialized_compact() {
    let r = resolve("got {{B.items.score}} points", &outputs(), &labels(), None);
    assert_eq!(r.text, "got [9,5] points");
  }

  #[test]
  fn test_loop_scope_reference() {
    let scope = LoopScope {
      loop_node_id: "refine".to_string(),
      iteration: 2,
      items: json!([1, 2, 3]),
    };
    let r = resolve("{{loop.iteration}}: {{loop.items}}", &outputs(), &labels(), Some(&scope));
    assert_eq!(r.text, "2: [1,2,3]");
  }

  #[test]
  fn test_pure_template_stays_structured() {
    let params = json!({ "items": "{{B.items}}", "note": "see {{A.text}}" });
    let resolved = resolve_value(&params, &outputs(), &labels(), None);
    assert_eq!(
      resolved.value,
      json!({ "items": [{ "score": 9 }, { "score": 5 }], "note": "see hi" })
    );
    assert!(resolved.warnings.is_empty());
  }

  #[test]
  fn test_resolution_never_errors_on_junk() {
    let r = resolve("{{}} {{...}} {{A.}}", &outputs(), &labels(), None);
    // Junk references stay verbatim; no panic, warnings recorded.
    assert!(r.text.contains("{{"));
  }
}
