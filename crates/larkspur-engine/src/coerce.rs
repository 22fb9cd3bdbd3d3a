//! Output-shape coercion for llm/tool node results.
//!
//! When a node declares an output shape, the raw capability result is
//! coerced field-by-field to the declared types. Missing or unparseable
//! fields get the type-appropriate zero value instead of failing the node.

use larkspur_config::{FieldType, OutputField, OutputShape, ShapeKind};
use serde_json::{Map, Value, json};

/// Coerce a raw capability result to the declared shape.
pub fn coerce_output(shape: &OutputShape, raw: &Value) -> Value {
  match shape.kind {
    ShapeKind::Object => coerce_object(&shape.fields, raw),
    ShapeKind::Array => match raw {
      Value::Array(items) => Value::Array(
        items.iter().map(|item| coerce_object(&shape.fields, item)).collect(),
      ),
      // A single object against an array shape becomes a one-element list.
      Value::Object(_) => json!([coerce_object(&shape.fields, raw)]),
      _ => json!([]),
    },
  }
}

fn coerce_object(fields: &[OutputField], raw: &Value) -> Value {
  let empty = Map::new();
  let map = raw.as_object().unwrap_or(&empty);
  Value::Object(
    fields
      .iter()
      .map(|field| {
        let value = map.get(&field.name).unwrap_or(&Value::Null);
        (field.name.clone(), coerce_field(field.field_type, value))
      })
      .collect(),
  )
}

fn coerce_field(field_type: FieldType, value: &Value) -> Value {
  match field_type {
    FieldType::String => match value {
      Value::String(s) => Value::String(s.clone()),
      Value::Null => Value::String(String::new()),
      other => Value::String(other.to_string()),
    },
    FieldType::Integer => json!(as_integer(value).unwrap_or(0)),
    FieldType::Boolean => json!(as_boolean(value)),
  }
}

/// Integer parsing accepts floats and numeric strings, truncating toward
/// zero ("7.0" and 7.9 both coerce to 7).
fn as_integer(value: &Value) -> Option<i64> {
  match value {
    Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
    Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
    _ => None,
  }
}

fn as_boolean(value: &Value) -> bool {
  match value {
    Value::Bool(b) => *b,
    Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
    Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
    _ => false,
  }
}
