use serde::{Deserialize, Serialize};

/// A directed edge between two nodes.
///
/// `condition` is only meaningful when the source is a condition node: it
/// names the branch ("true" or "false") this edge carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDef {
  pub id: String,
  pub source: String,
  pub target: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub condition: Option<String>,
}
