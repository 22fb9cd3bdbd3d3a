use serde::{Deserialize, Serialize};

/// Comparators usable in condition predicates and loop break conditions.
///
/// This is deliberately a closed set; there is no general expression
/// language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
  #[serde(rename = "==")]
  Eq,
  #[serde(rename = "!=")]
  Ne,
  #[serde(rename = ">")]
  Gt,
  #[serde(rename = ">=")]
  Gte,
  #[serde(rename = "<")]
  Lt,
  #[serde(rename = "<=")]
  Lte,
  #[serde(rename = "contains")]
  Contains,
  #[serde(rename = "not_contains")]
  NotContains,
  #[serde(rename = "is_empty")]
  IsEmpty,
  #[serde(rename = "is_not_empty")]
  IsNotEmpty,
}

/// How multiple break conditions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
  #[default]
  And,
  Or,
}
