use serde::{Deserialize, Serialize};

/// Declared output shape of an llm/tool node.
///
/// When present, the raw capability result is coerced field-by-field to this
/// shape before it becomes the node output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputShape {
  pub kind: ShapeKind,
  pub fields: Vec<OutputField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
  Object,
  Array,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputField {
  pub name: String,
  #[serde(rename = "type")]
  pub field_type: FieldType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
  String,
  Integer,
  Boolean,
}
