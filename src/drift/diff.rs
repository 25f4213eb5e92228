//! Structural comparison of configuration maps.
//!
//! Walks baseline and live maps together and records every field path whose
//! values disagree. Objects compare key by key, ordered lists element by
//! element (`disks[0].size_gb`), and lists under a set-like path as
//! multisets. Numbers compare by value, so `1` and `1.0` are equal.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::adapter::ConfigMap;
use crate::errors::{EngineError, Result};

/// One disagreeing field; `None` means the field is absent on that side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    pub field_path: String,
    pub baseline_value: Option<Value>,
    pub live_value: Option<Value>,
}

/// Field path patterns whose arrays are compared without regard to order
#[derive(Debug, Clone, Default)]
pub struct SetLikeFields {
    patterns: Vec<Regex>,
}

impl SetLikeFields {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern.as_ref()).map_err(|e| {
                    EngineError::validation_field(
                        format!("Invalid set-like pattern '{}': {}", pattern.as_ref(), e),
                        "drift.set_like_fields",
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, field_path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(field_path))
    }
}

/// Compare a baseline config against live state
pub fn diff_configs(
    baseline: &ConfigMap,
    live: &ConfigMap,
    set_like: &SetLikeFields,
) -> Vec<FieldDelta> {
    let mut deltas = Vec::new();
    compare_maps(baseline, live, "", set_like, &mut deltas);
    deltas
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn compare_maps(
    baseline: &ConfigMap,
    live: &ConfigMap,
    path: &str,
    set_like: &SetLikeFields,
    deltas: &mut Vec<FieldDelta>,
) {
    let keys: BTreeSet<&String> = baseline.keys().chain(live.keys()).collect();

    for key in keys {
        let field_path = child_path(path, key);
        match (baseline.get(key), live.get(key)) {
            (Some(expected), Some(actual)) => {
                compare_values(expected, actual, &field_path, set_like, deltas)
            }
            (expected, actual) => deltas.push(FieldDelta {
                field_path,
                baseline_value: expected.cloned(),
                live_value: actual.cloned(),
            }),
        }
    }
}

fn compare_values(
    expected: &Value,
    actual: &Value,
    path: &str,
    set_like: &SetLikeFields,
    deltas: &mut Vec<FieldDelta>,
) {
    match (expected, actual) {
        (Value::Object(expected), Value::Object(actual)) => {
            compare_maps(expected, actual, path, set_like, deltas)
        }
        (Value::Array(expected_items), Value::Array(actual_items)) if set_like.matches(path) => {
            if multiset(expected_items) != multiset(actual_items) {
                deltas.push(FieldDelta {
                    field_path: path.to_string(),
                    baseline_value: Some(expected.clone()),
                    live_value: Some(actual.clone()),
                });
            }
        }
        (Value::Array(expected_items), Value::Array(actual_items)) => {
            let len = expected_items.len().max(actual_items.len());
            for index in 0..len {
                let item_path = format!("{}[{}]", path, index);
                match (expected_items.get(index), actual_items.get(index)) {
                    (Some(e), Some(a)) => compare_values(e, a, &item_path, set_like, deltas),
                    (e, a) => deltas.push(FieldDelta {
                        field_path: item_path,
                        baseline_value: e.cloned(),
                        live_value: a.cloned(),
                    }),
                }
            }
        }
        (Value::Number(e), Value::Number(a)) => {
            if !numbers_equal(e, a) {
                deltas.push(FieldDelta {
                    field_path: path.to_string(),
                    baseline_value: Some(expected.clone()),
                    live_value: Some(actual.clone()),
                });
            }
        }
        _ => {
            if expected != actual {
                deltas.push(FieldDelta {
                    field_path: path.to_string(),
                    baseline_value: Some(expected.clone()),
                    live_value: Some(actual.clone()),
                });
            }
        }
    }
}

/// Integer value of `n` if it has one: integers as-is, floats only when
/// they are whole and fit
fn exact_integer(n: &Number) -> Option<i128> {
    if let Some(i) = n.as_i64() {
        return Some(i128::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Some(i128::from(u));
    }
    n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 1e38).map(|f| f as i128)
}

/// `2` equals `2.0`, and integers beyond 2^53 keep full precision
fn numbers_equal(a: &Number, b: &Number) -> bool {
    match (exact_integer(a), exact_integer(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.as_f64() == b.as_f64(),
    }
}

fn multiset(items: &[Value]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        *counts.entry(canonical_key(item)).or_insert(0) += 1;
    }
    counts
}

/// Order-independent rendering used to bucket set elements
fn canonical_key(value: &Value) -> String {
    match value {
        Value::Number(n) => match (exact_integer(n), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) => format!("{}", f),
            (None, None) => n.to_string(),
        },
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_key).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonical_key(v))).collect();
            let parts: Vec<String> =
                sorted.into_iter().map(|(k, v)| format!("{:?}:{}", k, v)).collect();
            format!("{{{}}}", parts.join(","))
        }
        other => other.to_string(),
    }
}
