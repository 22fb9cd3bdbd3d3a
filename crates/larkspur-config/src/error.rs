use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to parse workflow definition: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("duplicate node id: {0}")]
  DuplicateNode(String),

  // `source` as a field name would collide with thiserror's Error::source.
  #[error("edge references unknown node: source={edge_source}, target={target}")]
  InvalidEdge { edge_source: String, target: String },
}
