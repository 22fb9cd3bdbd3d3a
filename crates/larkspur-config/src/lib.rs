//! Larkspur Config
//!
//! This crate provides the declarative workflow representation for larkspur.
//! A workflow is a flat list of nodes plus directed edges; loop membership is
//! expressed as a per-node attribute rather than nesting, and is turned into
//! an adjacency index by the compiler in `larkspur-engine`.
//!
//! It also provides [`Release`], the immutable, checksummed form of a
//! workflow spec that runs are executed against.

mod edge;
mod enums;
mod error;
mod node;
mod release;
mod shape;
mod workflow;

pub use edge::EdgeDef;
pub use enums::{Combinator, Comparator};
pub use error::ConfigError;
pub use node::{BreakCondition, ConditionDef, LoopSettings, NodeDef, NodeKind};
pub use release::Release;
pub use shape::{FieldType, OutputField, OutputShape, ShapeKind};
pub use workflow::WorkflowDef;
