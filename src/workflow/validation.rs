//! Pre-deployment validation.
//!
//! A target configuration must satisfy the optional JSON schema, must not
//! carry a forbidden value for its environment, and the provider credential
//! must be retrievable. All three run before anything is mutated.

use std::sync::Arc;

use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::ConfigMap;
use crate::collector::normalize::get_path;
use crate::errors::{EngineError, Result};
use crate::secrets::{SecretsError, SecretsVault};

use super::run::Environment;

/// A value that must never be deployed at `path`
///
/// ```yaml
/// forbidden_values:
///   - path: network.public_ip
///     values: [true]
///     environments: [prod]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForbiddenValueRule {
    pub path: String,
    pub values: Vec<Value>,
    /// Environments the rule applies to; all of them when absent
    #[serde(default)]
    pub environments: Option<Vec<Environment>>,
}

impl ForbiddenValueRule {
    fn applies_to(&self, environment: Environment) -> bool {
        match &self.environments {
            Some(envs) => envs.contains(&environment),
            None => true,
        }
    }
}

/// Detailed validation failure for one field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

#[derive(Clone)]
pub struct ConfigValidator {
    schema: Option<Arc<Validator>>,
    forbidden: Vec<ForbiddenValueRule>,
}

impl std::fmt::Debug for ConfigValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigValidator")
            .field("has_schema", &self.schema.is_some())
            .field("forbidden", &self.forbidden.len())
            .finish()
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self { schema: None, forbidden: Vec::new() }
    }
}

impl ConfigValidator {
    pub fn new(schema: Option<Value>, forbidden: Vec<ForbiddenValueRule>) -> Result<Self> {
        let schema = match schema {
            Some(schema) => Some(Arc::new(
                Validator::options().with_draft(Draft::Draft7).build(&schema).map_err(|e| {
                    EngineError::config(format!("Failed to compile deployment schema: {}", e))
                })?,
            )),
            None => None,
        };
        Ok(Self { schema, forbidden })
    }

    /// Every issue with `config`, empty when it may be deployed to `environment`
    pub fn issues(&self, config: &ConfigMap, environment: Environment) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if let Some(schema) = &self.schema {
            let instance = Value::Object(config.clone());
            issues.extend(schema.iter_errors(&instance).map(|e| ValidationIssue {
                path: e.instance_path.to_string(),
                message: e.to_string(),
            }));
        }

        for rule in self.forbidden.iter().filter(|r| r.applies_to(environment)) {
            if let Some(value) = get_path(config, &rule.path) {
                if rule.values.contains(value) {
                    issues.push(ValidationIssue {
                        path: rule.path.clone(),
                        message: format!("value {} is forbidden in {}", value, environment),
                    });
                }
            }
        }

        issues
    }

    pub fn validate(&self, config: &ConfigMap, environment: Environment) -> Result<()> {
        let issues = self.issues(config, environment);
        let Some(first) = issues.first() else {
            return Ok(());
        };

        let message = issues
            .iter()
            .map(|i| format!("{}: {}", i.path, i.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(EngineError::validation_field(message, first.path.clone()))
    }
}

/// Check the provider credential can be decrypted. The value itself is
/// dropped immediately.
pub async fn preflight_credential(vault: &SecretsVault, credential_id: &str) -> Result<()> {
    match vault.retrieve(credential_id).await {
        Ok(_) => Ok(()),
        Err(SecretsError::NotFound { id }) => {
            Err(EngineError::authorization(format!("Credential '{}' is not available", id)))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde_json::json;

    fn config(value: Value) -> ConfigMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_forbidden_value_scoped_to_environment() {
        let rules: Vec<ForbiddenValueRule> = serde_yaml::from_str(
            "- path: network.public_ip\n  values: [true]\n  environments: [prod]\n",
        )
        .unwrap();
        let validator = ConfigValidator::new(None, rules).unwrap();
        let target = config(json!({"network": {"public_ip": true}}));

        assert!(validator.validate(&target, Environment::Dev).is_ok());
        let err = validator.validate(&target, Environment::Prod).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("network.public_ip"));
    }

    #[test]
    fn test_schema_violations_are_collected() {
        let schema = json!({
            "type": "object",
            "required": ["cpu"],
            "properties": {"cpu": {"type": "integer", "minimum": 1}}
        });
        let validator = ConfigValidator::new(Some(schema), vec![]).unwrap();

        assert!(validator.validate(&config(json!({"cpu": 2})), Environment::Dev).is_ok());
        assert_eq!(validator.issues(&config(json!({"cpu": 0})), Environment::Dev).len(), 1);
        assert!(validator.validate(&config(json!({"mem": 1})), Environment::Dev).is_err());
    }

    #[test]
    fn test_invalid_schema_is_config_error() {
        let err = ConfigValidator::new(Some(json!({"type": 12})), vec![]).unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }
}
