//! Shared per-run execution context threaded into every handler call.

use std::collections::HashMap;

use larkspur_capability::CapabilityRegistry;
use larkspur_tracker::RunTracker;
use tokio_util::sync::CancellationToken;

/// Everything a handler needs that is constant for the duration of one run.
///
/// The mutable node-output map is passed separately: the executor owns it
/// between batches, and loop iterations work on overlaid snapshots.
pub(crate) struct ExecContext<'a, S> {
  pub run_id: &'a str,
  pub registry: &'a CapabilityRegistry,
  pub tracker: &'a RunTracker<S>,
  pub labels: &'a HashMap<String, String>,
  pub cancel: &'a CancellationToken,
}
