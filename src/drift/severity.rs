//! Rule-based severity classification.
//!
//! The rule table is data: it is loaded from YAML or inline configuration,
//! compiled once, and applied to every difference a scan produces. A field
//! path matching several rules takes the highest severity among them.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(EngineError::validation(format!("Unknown severity '{}'", other))),
        }
    }
}

/// One entry of the rule table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityRule {
    pub name: String,
    /// Policy tag, e.g. `security` or `capacity`
    pub tag: String,
    pub severity: Severity,
    /// Regular expressions matched against the dotted field path
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityRuleTable {
    #[serde(default)]
    pub rules: Vec<SeverityRule>,
    #[serde(default)]
    pub default_severity: Severity,
}

impl Default for SeverityRuleTable {
    fn default() -> Self {
        Self {
            rules: vec![
                SeverityRule {
                    name: "authentication".to_string(),
                    tag: "security".to_string(),
                    severity: Severity::Critical,
                    patterns: vec![
                        r"(^|\.)(auth|authentication|password|ssh_keys?|credentials?|users?)(\.|\[|$)"
                            .to_string(),
                    ],
                },
                SeverityRule {
                    name: "network_exposure".to_string(),
                    tag: "security".to_string(),
                    severity: Severity::Critical,
                    patterns: vec![
                        r"(^|\.)firewall(\.|\[|$)".to_string(),
                        r"(^|\.)(public|public_ip|exposed_ports|open_ports)(\.|\[|$)".to_string(),
                    ],
                },
                SeverityRule {
                    name: "encryption".to_string(),
                    tag: "security".to_string(),
                    severity: Severity::Critical,
                    patterns: vec![
                        r"(^|\.)(encryption|encrypted|tls|ssl)(_[a-z]+)?(\.|\[|$)".to_string()
                    ],
                },
                SeverityRule {
                    name: "capacity".to_string(),
                    tag: "capacity".to_string(),
                    severity: Severity::Medium,
                    patterns: vec![
                        r"(^|\.)(cpu|cpus|cores|sockets|memory|disks?|storage)(_[a-z]+)?(\.|\[|$)"
                            .to_string(),
                    ],
                },
            ],
            default_severity: Severity::Low,
        }
    }
}

impl SeverityRuleTable {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::io(e, format!("Failed to read severity rules {}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Compile every pattern; an invalid regex rejects the whole table
    pub fn compile(&self) -> Result<SeverityClassifier> {
        let rules = self
            .rules
            .iter()
            .map(|rule| {
                let patterns = rule
                    .patterns
                    .iter()
                    .map(|pattern| {
                        Regex::new(pattern).map_err(|e| {
                            EngineError::validation_field(
                                format!("Invalid pattern '{}' in rule '{}': {}", pattern, rule.name, e),
                                "drift.rules",
                            )
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(CompiledRule { severity: rule.severity, patterns })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SeverityClassifier { rules, default_severity: self.default_severity })
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    severity: Severity,
    patterns: Vec<Regex>,
}

/// Compiled form of a [`SeverityRuleTable`]
#[derive(Debug, Clone)]
pub struct SeverityClassifier {
    rules: Vec<CompiledRule>,
    default_severity: Severity,
}

impl Default for SeverityClassifier {
    fn default() -> Self {
        // The built-in patterns are constants and always compile.
        SeverityRuleTable::default().compile().unwrap_or(Self {
            rules: Vec::new(),
            default_severity: Severity::Low,
        })
    }
}

impl SeverityClassifier {
    pub fn classify(&self, field_path: &str) -> Severity {
        self.rules
            .iter()
            .filter(|rule| rule.patterns.iter().any(|p| p.is_match(field_path)))
            .map(|rule| rule.severity)
            .max()
            .unwrap_or(self.default_severity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_table() {
        let classifier = SeverityClassifier::default();

        assert_eq!(classifier.classify("network.public"), Severity::Critical);
        assert_eq!(classifier.classify("network.firewall.rules"), Severity::Critical);
        assert_eq!(classifier.classify("ssh_keys[0]"), Severity::Critical);
        assert_eq!(classifier.classify("tls_enabled"), Severity::Critical);
        assert_eq!(classifier.classify("storage.encryption.enabled"), Severity::Critical);
        assert_eq!(classifier.classify("memory_bytes"), Severity::Medium);
        assert_eq!(classifier.classify("disks[1].size_gb"), Severity::Medium);
        assert_eq!(classifier.classify("cpu"), Severity::Medium);
        assert_eq!(classifier.classify("tags"), Severity::Low);
        assert_eq!(classifier.classify("description"), Severity::Low);
    }

    #[test]
    fn test_highest_matching_rule_wins() {
        let table = SeverityRuleTable::from_yaml_str(
            r#"
rules:
  - name: storage
    tag: capacity
    severity: medium
    patterns: ['^storage']
  - name: storage-keys
    tag: security
    severity: high
    patterns: ['key']
default_severity: low
"#,
        )
        .unwrap();
        let classifier = table.compile().unwrap();

        assert_eq!(classifier.classify("storage.size"), Severity::Medium);
        assert_eq!(classifier.classify("storage.key_id"), Severity::High);
        assert_eq!(classifier.classify("name"), Severity::Low);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let table = SeverityRuleTable {
            rules: vec![SeverityRule {
                name: "broken".to_string(),
                tag: "security".to_string(),
                severity: Severity::Critical,
                patterns: vec!["(".to_string()],
            }],
            default_severity: Severity::Low,
        };
        assert!(table.compile().is_err());
    }

    #[test]
    fn test_severity_ordering_and_parsing() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("urgent".parse::<Severity>().is_err());
    }

    proptest! {
        #[test]
        fn classification_is_deterministic(path in "[a-z_]{1,8}(\\.[a-z_]{1,8}){0,3}") {
            let classifier = SeverityClassifier::default();
            prop_assert_eq!(classifier.classify(&path), classifier.classify(&path));
        }
    }
}
