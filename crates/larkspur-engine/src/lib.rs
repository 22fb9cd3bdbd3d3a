//! Larkspur Engine
//!
//! Compiles declarative workflow definitions into executable graphs and
//! drives runs to completion: ready-node batches at the top level, a
//! wave-based sub-executor for loop bodies, and fail-soft per-node error
//! handling throughout. Every node transition goes through the tracker and
//! ends up in the persisted journal.

mod coerce;
mod compile;
mod context;
mod error;
mod handler;
mod loop_exec;
mod predicate;

mod executor;

pub use coerce::coerce_output;
pub use compile::{CompiledGraph, GraphEdge, LoopBody, compile};
pub use error::{CompileError, EngineError};
pub use executor::RunExecutor;
pub use loop_exec::DEFAULT_MAX_ITERATIONS;
pub use predicate::{combine, evaluate};
