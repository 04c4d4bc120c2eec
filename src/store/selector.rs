//! Field predicates evaluated against stored JSON rows.
//!
//! A selector is a JSON object mapping dot paths to conditions:
//!
//! ```ignore
//! {
//!   "dept.id": 10,
//!   "salary": { "$gt": 1000 },
//!   "$or": [{ "name": { "$regex": "^A" } }, { "name": "Bob" }]
//! }
//! ```
//!
//! A bare value means equality. Equality is loose across scalar types, since
//! values taken from URL parameters are always strings.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

type Patterns = HashMap<String, Regex>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector(Map<String, Value>);

impl Selector {
  /// Matches every row.
  pub fn all() -> Self {
    Self::default()
  }

  pub fn from_value(value: Value) -> Result<Self> {
    match value {
      Value::Object(map) => Ok(Self(map)),
      Value::Null => Ok(Self::all()),
      other => Err(eyre!("Selector must be a JSON object, got {}", other)),
    }
  }

  /// Add an equality condition on `path`.
  pub fn eq(mut self, path: &str, value: impl Into<Value>) -> Self {
    self.0.insert(path.to_string(), value.into());
    self
  }

  /// Conjunction of selectors.
  pub fn and(selectors: Vec<Selector>) -> Self {
    let mut map = Map::new();
    map.insert(
      "$and".to_string(),
      Value::Array(selectors.into_iter().map(|s| Value::Object(s.0)).collect()),
    );
    Self(map)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Compile the `$regex` patterns once for matching many rows.
  pub fn compile(&self) -> Result<CompiledSelector<'_>> {
    let mut patterns = Patterns::new();
    collect_patterns(&self.0, &mut patterns)?;
    Ok(CompiledSelector {
      selector: &self.0,
      patterns,
    })
  }

  pub fn matches(&self, row: &Value) -> Result<bool> {
    self.compile()?.matches(row)
  }
}

/// A selector with its regular expressions built.
pub struct CompiledSelector<'a> {
  selector: &'a Map<String, Value>,
  patterns: Patterns,
}

impl CompiledSelector<'_> {
  pub fn matches(&self, row: &Value) -> Result<bool> {
    matches_map(self.selector, row, &self.patterns)
  }
}

fn collect_patterns(selector: &Map<String, Value>, patterns: &mut Patterns) -> Result<()> {
  for (field, condition) in selector {
    if field == "$and" || field == "$or" {
      for sub in condition.as_array().into_iter().flatten() {
        if let Some(sub) = sub.as_object() {
          collect_patterns(sub, patterns)?;
        }
      }
      continue;
    }

    let Some(pattern) = is_operator_map(condition)
      .and_then(|ops| ops.get("$regex"))
      .and_then(Value::as_str)
    else {
      continue;
    };
    if !patterns.contains_key(pattern) {
      let regex = Regex::new(pattern).map_err(|e| eyre!("Invalid $regex '{}': {}", pattern, e))?;
      patterns.insert(pattern.to_string(), regex);
    }
  }
  Ok(())
}

fn matches_map(selector: &Map<String, Value>, row: &Value, patterns: &Patterns) -> Result<bool> {
  for (field, condition) in selector {
    let matched = match field.as_str() {
      "$and" => {
        let mut all = true;
        for sub in as_selector_list(condition)? {
          if !matches_map(sub, row, patterns)? {
            all = false;
            break;
          }
        }
        all
      }
      "$or" => {
        let mut any = false;
        for sub in as_selector_list(condition)? {
          if matches_map(sub, row, patterns)? {
            any = true;
            break;
          }
        }
        any
      }
      path => matches_condition(lookup(row, path), condition, patterns)?,
    };
    if !matched {
      return Ok(false);
    }
  }
  Ok(true)
}

fn as_selector_list(value: &Value) -> Result<Vec<&Map<String, Value>>> {
  let items = value
    .as_array()
    .ok_or_else(|| eyre!("$and/$or expects an array of selectors"))?;
  items
    .iter()
    .map(|item| {
      item
        .as_object()
        .ok_or_else(|| eyre!("$and/$or entries must be objects"))
    })
    .collect()
}

fn is_operator_map(condition: &Value) -> Option<&Map<String, Value>> {
  condition
    .as_object()
    .filter(|map| !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn matches_condition(
  field: Option<&Value>,
  condition: &Value,
  patterns: &Patterns,
) -> Result<bool> {
  let Some(ops) = is_operator_map(condition) else {
    return Ok(field.is_some_and(|v| loose_eq(v, condition)));
  };

  for (op, operand) in ops {
    let ok = match op.as_str() {
      "$eq" => field.is_some_and(|v| loose_eq(v, operand)),
      "$ne" => !field.is_some_and(|v| loose_eq(v, operand)),
      "$gt" => compare(field, operand) == Some(Ordering::Greater),
      "$gte" => matches!(
        compare(field, operand),
        Some(Ordering::Greater | Ordering::Equal)
      ),
      "$lt" => compare(field, operand) == Some(Ordering::Less),
      "$lte" => matches!(
        compare(field, operand),
        Some(Ordering::Less | Ordering::Equal)
      ),
      "$exists" => {
        let wanted = operand.as_bool().unwrap_or(true);
        field.is_some_and(|v| !v.is_null()) == wanted
      }
      "$in" => {
        let options = operand
          .as_array()
          .ok_or_else(|| eyre!("$in expects an array"))?;
        field.is_some_and(|v| options.iter().any(|o| loose_eq(v, o)))
      }
      "$regex" => {
        let pattern = operand
          .as_str()
          .ok_or_else(|| eyre!("$regex expects a string pattern"))?;
        let regex = patterns
          .get(pattern)
          .ok_or_else(|| eyre!("$regex '{}' was not compiled", pattern))?;
        field
          .and_then(scalar_text)
          .is_some_and(|text| regex.is_match(&text))
      }
      other => return Err(eyre!("Unsupported selector operator: {}", other)),
    };
    if !ok {
      return Ok(false);
    }
  }
  Ok(true)
}

/// Resolve a dot path (`a.b.0.c`) inside a JSON value.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
  path.split('.').try_fold(value, |current, segment| match current {
    Value::Object(map) => map.get(segment),
    Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
    _ => None,
  })
}

/// Textual form of a scalar, used for loose comparisons.
pub fn scalar_text(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
  if a == b {
    return true;
  }
  if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
    return x == y;
  }
  match (scalar_text(a), scalar_text(b)) {
    (Some(x), Some(y)) => x == y,
    _ => false,
  }
}

fn as_number(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

fn compare(field: Option<&Value>, operand: &Value) -> Option<Ordering> {
  let field = field?;
  if let (Some(a), Some(b)) = (as_number(field), as_number(operand)) {
    return a.partial_cmp(&b);
  }
  match (field, operand) {
    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
    _ => None,
  }
}
