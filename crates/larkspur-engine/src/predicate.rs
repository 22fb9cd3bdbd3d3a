//! Minimal predicate evaluator for condition nodes and loop break
//! conditions.
//!
//! This is deliberately not an expression language: a predicate is one
//! (left, comparator, right) triple, and multiple break conditions combine
//! with a single AND/OR. Anything beyond that is out of scope.

use larkspur_config::{Combinator, Comparator};
use serde_json::Value;

/// Evaluate `left <comparator> right`.
///
/// A list-valued `left` compares all-of across its elements, except for the
/// emptiness and containment comparators, which apply to the list itself.
pub fn evaluate(left: &Value, comparator: Comparator, right: &Value) -> bool {
  match comparator {
    Comparator::IsEmpty => is_empty(left),
    Comparator::IsNotEmpty => !is_empty(left),
    Comparator::Contains | Comparator::NotContains => compare(left, comparator, right),
    _ => match left {
      Value::Array(items) => {
        !items.is_empty() && items.iter().all(|item| compare(item, comparator, right))
      }
      other => compare(other, comparator, right),
    },
  }
}

/// Fold a list of evaluated conditions with the configured combinator.
///
/// An empty list is vacuously false: a loop with no break conditions never
/// breaks on them.
pub fn combine(results: &[bool], combinator: Combinator) -> bool {
  if results.is_empty() {
    return false;
  }
  match combinator {
    Combinator::And => results.iter().all(|r| *r),
    Combinator::Or => results.iter().any(|r| *r),
  }
}

fn compare(left: &Value, comparator: Comparator, right: &Value) -> bool {
  match comparator {
    Comparator::Eq => loose_eq(left, right),
    Comparator::Ne => !loose_eq(left, right),
    Comparator::Gt => numeric(left, right).is_some_and(|(l, r)| l > r),
    Comparator::Gte => numeric(left, right).is_some_and(|(l, r)| l >= r),
    Comparator::Lt => numeric(left, right).is_some_and(|(l, r)| l < r),
    Comparator::Lte => numeric(left, right).is_some_and(|(l, r)| l <= r),
    Comparator::Contains => contains(left, right),
    Comparator::NotContains => !contains(left, right),
    Comparator::IsEmpty => is_empty(left),
    Comparator::IsNotEmpty => !is_empty(left),
  }
}

/// Equality with numeric coercion: `5`, `5.0` and `"5"` are equal.
fn loose_eq(left: &Value, right: &Value) -> bool {
  if let Some((l, r)) = numeric(left, right) {
    return l == r;
  }
  match (left, right) {
    (Value::String(l), Value::String(r)) => l == r,
    (l, r) => l == r,
  }
}

fn numeric(left: &Value, right: &Value) -> Option<(f64, f64)> {
  Some((as_f64(left)?, as_f64(right)?))
}

fn as_f64(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

fn contains(left: &Value, right: &Value) -> bool {
  match left {
    Value::String(haystack) => match right {
      Value::String(needle) => haystack.contains(needle.as_str()),
      other => haystack.contains(&other.to_string()),
    },
    Value::Array(items) => items.iter().any(|item| loose_eq(item, right)),
    Value::Object(map) => right.as_str().is_some_and(|key| map.contains_key(key)),
    _ => false,
  }
}

fn is_empty(value: &Value) -> bool {
  match value {
    Value::Null => true,
    Value::String(s) => s.is_empty(),
    Value::Array(items) => items.is_empty(),
    Value::Object(map) => map.is_empty(),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_numeric_comparisons() {
    assert!(evaluate(&json!(5), Comparator::Gt, &json!(3)));
    assert!(!evaluate(&json!(3), Comparator::Gt, &json!(3)));
    assert!(evaluate(&json!(3), Comparator::Gte, &json!(3)));
    assert!(evaluate(&json!("7.0"), Comparator::Eq, &json!(7)));
    assert!(evaluate(&json!(2), Comparator::Lte, &json!(2.5)));
  }

  #[test]
  fn test_non_numeric_ordering_is_false() {
    assert!(!evaluate(&json!("abc"), Comparator::Gt, &json!(1)));
    assert!(!evaluate(&json!(null), Comparator::Lt, &json!(1)));
  }

  #[test]
  fn test_list_compares_all_of() {
    assert!(evaluate(&json!([9, 8, 10]), Comparator::Gte, &json!(8)));
    assert!(!evaluate(&json!([9, 5, 7]), Comparator::Gte, &json!(8)));
    assert!(!evaluate(&json!([]), Comparator::Gte, &json!(8)));
  }

  #[test]
  fn test_contains() {
    assert!(evaluate(&json!("hello world"), Comparator::Contains, &json!("world")));
    assert!(evaluate(&json!([1, 2, 3]), Comparator::Contains, &json!(2)));
    assert!(!evaluate(&json!([1, 2, 3]), Comparator::Contains, &json!(5)));
    assert!(evaluate(&json!({ "a": 1 }), Comparator::Contains, &json!("a")));
    assert!(evaluate(&json!([1, 2]), Comparator::NotContains, &json!(5)));
  }

  #[test]
  fn test_emptiness() {
    assert!(evaluate(&json!(null), Comparator::IsEmpty, &Value::Null));
    assert!(evaluate(&json!(""), Comparator::IsEmpty, &Value::Null));
    assert!(evaluate(&json!([]), Comparator::IsEmpty, &Value::Null));
    assert!(evaluate(&json!([1]), Comparator::IsNotEmpty, &Value::Null));
    // Emptiness applies to the list itself, not all-of.
    assert!(evaluate(&json!([1, 2]), Comparator::IsNotEmpty, &Value::Null));
  }

  #[test]
  fn test_combinators() {
    assert!(combine(&[true, true], Combinator::And));
    assert!(!combine(&[true, false], Combinator::And));
    assert!(combine(&[true, false], Combinator::Or));
    assert!(!combine(&[], Combinator::And));
    assert!(!combine(&[], Combinator::Or));
  }
}
