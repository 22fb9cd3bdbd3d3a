//! Error types for workflow compilation and execution.

use larkspur_config::ConfigError;
use larkspur_store::StoreError;
use larkspur_tracker::TrackerError;
use thiserror::Error;

/// Errors raised while turning a workflow definition into an executable
/// graph. These are fatal: no run state is created.
#[derive(Debug, Error)]
pub enum CompileError {
  #[error("workflow has no start node")]
  MissingStart,

  #[error("workflow has {0} start nodes, expected exactly one")]
  MultipleStart(usize),

  #[error("workflow has no end node")]
  MissingEnd,

  #[error("workflow has {0} end nodes, expected exactly one")]
  MultipleEnd(usize),

  /// A node's loop membership points at a node that is missing or is not a
  /// loop node.
  #[error("node '{node_id}' references unknown loop '{loop_id}'")]
  DanglingLoop { node_id: String, loop_id: String },

  #[error("loop node '{node_id}' cannot be a member of its own body")]
  SelfLoop { node_id: String },

  #[error("node '{node_id}' uses unknown capability '{name}'")]
  UnknownCapability { node_id: String, name: String },

  /// Loop bodies may only contain llm, tool and condition nodes.
  #[error("node '{node_id}' of kind '{kind}' cannot be a loop-body member")]
  UnsupportedBodyNode { node_id: String, kind: &'static str },

  #[error(transparent)]
  Config(#[from] ConfigError),
}

/// Errors that fail a whole run (as opposed to per-node handler failures,
/// which are recorded on the NodeTask and do not abort the run).
#[derive(Debug, Error)]
pub enum EngineError {
  #[error(transparent)]
  Compile(#[from] CompileError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Tracker(#[from] TrackerError),

  #[error("run execution cancelled")]
  Cancelled,

  /// The graph has unexecuted nodes but none are eligible to run, which
  /// only happens with a cyclic definition.
  #[error("workflow stalled: no executable nodes remain")]
  Stalled,
}
