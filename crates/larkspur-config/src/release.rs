use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::workflow::WorkflowDef;

/// An immutable, checksummed compiled workflow spec.
///
/// Runs always execute against a release, never against a mutable workflow
/// definition, so a run remains reproducible after the workflow is edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
  pub id: String,
  pub workflow_id: String,
  pub version: i64,
  pub spec: serde_json::Value,
  pub checksum: String,
  pub created_at: DateTime<Utc>,
}

impl Release {
  /// Freeze a workflow definition into a release.
  ///
  /// The checksum is a sha256 over the serialized spec; `Vec`-based node and
  /// edge lists keep serialization order stable, so identical definitions
  /// produce identical checksums.
  pub fn from_def(workflow_id: &str, version: i64, def: &WorkflowDef) -> Result<Self, ConfigError> {
    let spec = serde_json::to_value(def)?;
    let bytes = serde_json::to_vec(&spec)?;
    let checksum = format!("{:x}", Sha256::digest(&bytes));
    Ok(Self {
      id: Uuid::new_v4().to_string(),
      workflow_id: workflow_id.to_string(),
      version,
      spec,
      checksum,
      created_at: Utc::now(),
    })
  }

  /// Parse the frozen spec back into a workflow definition.
  pub fn def(&self) -> Result<WorkflowDef, ConfigError> {
    Ok(serde_json::from_value(self.spec.clone())?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn def() -> WorkflowDef {
    serde_json::from_value(json!({
      "nodes": [
        { "id": "a", "type": "start" },
        { "id": "b", "type": "end" }
      ],
      "edges": [{ "id": "e1", "source": "a", "target": "b" }]
    }))
    .unwrap()
  }

  #[test]
  fn test_checksum_is_stable() {
    let r1 = Release::from_def("wf", 1, &def()).unwrap();
    let r2 = Release::from_def("wf", 2, &def()).unwrap();
    assert_eq!(r1.checksum, r2.checksum);
    assert_ne!(r1.id, r2.id);
  }

  #[test]
  fn test_def_roundtrip() {
    let release = Release::from_def("wf", 1, &def()).unwrap();
    assert_eq!(release.def().unwrap(), def());
  }
}
