//! Provider-to-canonical field normalisation.
//!
//! Providers name and scale fields differently from the baseline schema
//! (`mem_mb` vs `memory_bytes`). Normalising before diffing keeps the
//! comparison purely structural. Paths are dotted (`network.public`).

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::adapter::ConfigMap;

/// Move a field to its canonical path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameRule {
    pub from: String,
    pub to: String,
}

/// Convert a numeric field into canonical units at `target`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRule {
    pub source: String,
    pub target: String,
    pub factor: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationRules {
    pub renames: Vec<RenameRule>,
    pub scale: Vec<ScaleRule>,
}

impl NormalizationRules {
    pub fn is_empty(&self) -> bool {
        self.renames.is_empty() && self.scale.is_empty()
    }
}

/// Applies [`NormalizationRules`]: renames first, then unit scaling.
#[derive(Debug, Clone, Default)]
pub struct FieldNormalizer {
    rules: NormalizationRules,
}

impl FieldNormalizer {
    pub fn new(rules: NormalizationRules) -> Self {
        Self { rules }
    }

    pub fn normalize(&self, mut config: ConfigMap) -> ConfigMap {
        for rule in &self.rules.renames {
            if let Some(value) = remove_path(&mut config, &rule.from) {
                insert_path(&mut config, &rule.to, value);
            }
        }

        for rule in &self.rules.scale {
            let Some(value) = remove_path(&mut config, &rule.source) else {
                continue;
            };
            match value.as_f64() {
                Some(raw) => insert_path(&mut config, &rule.target, scaled_number(raw * rule.factor)),
                None => {
                    tracing::debug!(field = %rule.source, "Skipping scale rule for non-numeric field");
                    insert_path(&mut config, &rule.source, value);
                }
            }
        }

        config
    }
}

/// Integral results stay integers so they compare equal to integer baselines
fn scaled_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Borrow the value at a dotted path
pub fn get_path<'a>(config: &'a ConfigMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = config.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Remove and return the value at a dotted path
pub fn remove_path(config: &mut ConfigMap, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => config.remove(path),
        Some((parent, leaf)) => {
            let mut current = config;
            for segment in parent.split('.') {
                current = current.get_mut(segment)?.as_object_mut()?;
            }
            current.remove(leaf)
        }
    }
}

/// Insert a value at a dotted path, creating intermediate objects
pub fn insert_path(config: &mut ConfigMap, path: &str, value: Value) {
    match path.rsplit_once('.') {
        None => {
            config.insert(path.to_string(), value);
        }
        Some((parent, leaf)) => {
            let mut current = config;
            for segment in parent.split('.') {
                let slot = current
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(ConfigMap::new()));
                if !slot.is_object() {
                    *slot = Value::Object(ConfigMap::new());
                }
                let Value::Object(next) = slot else {
                    return;
                };
                current = next;
            }
            current.insert(leaf.to_string(), value);
        }
    }
}
