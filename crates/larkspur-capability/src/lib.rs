//! Larkspur Capability
//!
//! The engine is agnostic to what a node actually does: model calls, search,
//! molecule generation and the like are all invoked through the opaque
//! [`Capability`] interface. Capabilities are collected in an explicit
//! [`CapabilityRegistry`] constructed once at startup and passed into the
//! compiler/executor; there are no ambient globals.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapabilityError {
  #[error("unknown capability: {0}")]
  Unknown(String),

  #[error("capability '{name}' failed: {message}")]
  Failed { name: String, message: String },
}

/// Read-only execution context handed to a capability.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
  pub run_id: String,
  pub node_id: String,
  /// Outputs of already-executed nodes, keyed by node id.
  pub node_outputs: HashMap<String, Value>,
  /// Loop iteration number when invoked from inside a loop body.
  pub loop_iteration: Option<u32>,
}

/// Raw result of a capability invocation.
#[derive(Debug, Clone)]
pub struct CapabilityOutput {
  pub value: Value,
  /// Capability-supplied metrics (token counts, latencies, ...), recorded
  /// on the NodeTask when present.
  pub metrics: Option<Value>,
}

impl CapabilityOutput {
  pub fn new(value: Value) -> Self {
    Self { value, metrics: None }
  }

  pub fn with_metrics(value: Value, metrics: Value) -> Self {
    Self { value, metrics: Some(metrics) }
  }
}

/// An opaque, named unit of work invoked by llm/tool nodes.
#[async_trait]
pub trait Capability: Send + Sync {
  async fn invoke(
    &self,
    params: Value,
    ctx: &InvocationContext,
  ) -> Result<CapabilityOutput, CapabilityError>;
}

/// Name-to-capability lookup table.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
  capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, name: impl Into<String>, capability: Arc<dyn Capability>) {
    self.capabilities.insert(name.into(), capability);
  }

  pub fn contains(&self, name: &str) -> bool {
    self.capabilities.contains_key(name)
  }

  pub async fn invoke(
    &self,
    name: &str,
    params: Value,
    ctx: &InvocationContext,
  ) -> Result<CapabilityOutput, CapabilityError> {
    let capability = self
      .capabilities
      .get(name)
      .ok_or_else(|| CapabilityError::Unknown(name.to_string()))?;
    capability.invoke(params, ctx).await
  }
}

impl std::fmt::Debug for CapabilityRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CapabilityRegistry")
      .field("capabilities", &self.capabilities.keys().collect::<Vec<_>>())
      .finish()
  }
}

/// Returns its resolved params verbatim as the output value.
///
/// Useful as a wiring/debugging capability and as the workhorse of the
/// engine tests.
#[derive(Debug, Clone, Default)]
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
  async fn invoke(
    &self,
    params: Value,
    _ctx: &InvocationContext,
  ) -> Result<CapabilityOutput, CapabilityError> {
    Ok(CapabilityOutput::new(params))
  }
}

/// Fails every invocation with a fixed message.
#[derive(Debug, Clone)]
pub struct FailingCapability {
  pub message: String,
}

#[async_trait]
impl Capability for FailingCapability {
  async fn invoke(
    &self,
    _params: Value,
    ctx: &InvocationContext,
  ) -> Result<CapabilityOutput, CapabilityError> {
    Err(CapabilityError::Failed {
      name: ctx.node_id.clone(),
      message: self.message.clone(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_registry_dispatch() {
    let mut registry = CapabilityRegistry::new();
    registry.register("echo", Arc::new(EchoCapability));

    let ctx = InvocationContext::default();
    let out = registry.invoke("echo", json!({ "a": 1 }), &ctx).await.unwrap();
    assert_eq!(out.value, json!({ "a": 1 }));
    assert!(out.metrics.is_none());
  }

  #[tokio::test]
  async fn test_unknown_capability() {
    let registry = CapabilityRegistry::new();
    let ctx = InvocationContext::default();
    let err = registry.invoke("nope", json!({}), &ctx).await.unwrap_err();
    assert!(matches!(err, CapabilityError::Unknown(name) if name == "nope"));
  }
}
