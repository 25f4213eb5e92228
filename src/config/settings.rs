//! # Configuration Settings
//!
//! Defines the configuration structure for the reconciliation engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::collector::NormalizationRules;
use crate::drift::SeverityRuleTable;
use crate::errors::{EngineError, Result};
use crate::workflow::ForbiddenValueRule;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Secrets vault configuration
    #[validate(nested)]
    pub vault: VaultSettings,

    /// Infrastructure provider endpoint
    #[validate(nested)]
    pub provider: ProviderConfig,

    /// State collection configuration
    #[validate(nested)]
    pub collector: CollectorConfig,

    /// Drift detection configuration
    #[validate(nested)]
    pub drift: DriftConfig,

    /// Remediation policy configuration
    #[validate(nested)]
    pub remediation: RemediationConfig,

    /// Deployment workflow configuration
    #[validate(nested)]
    pub workflow: WorkflowConfig,

    /// Database configuration
    #[validate(nested)]
    pub database: DatabaseConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(EngineError::from)?;
        self.validate_custom()?;
        Ok(())
    }

    /// Cross-field checks the validator derive cannot express
    fn validate_custom(&self) -> Result<()> {
        if self.collector.max_backoff_ms < self.collector.base_backoff_ms {
            return Err(EngineError::validation_field(
                "Max backoff must be greater than or equal to base backoff",
                "collector.max_backoff_ms",
            ));
        }

        if !self.database.url.starts_with("sqlite:") {
            return Err(EngineError::validation_field(
                "Database URL must start with 'sqlite:'",
                "database.url",
            ));
        }

        if self.drift.rules_path.is_some() && self.drift.rules.is_some() {
            return Err(EngineError::validation(
                "Configure either drift.rules_path or inline drift.rules, not both",
            ));
        }

        for pattern in self.drift.set_like_fields.iter().chain(&self.remediation.auto_fix_paths) {
            regex::Regex::new(pattern).map_err(|e| {
                EngineError::validation(format!("Invalid field pattern '{}': {}", pattern, e))
            })?;
        }

        Ok(())
    }
}

/// Secrets vault configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct VaultSettings {
    /// Encrypted credential store file (None = in-memory only)
    pub store_path: Option<PathBuf>,

    /// Name of the environment variable holding the master secret
    #[validate(length(min = 1, message = "Master key variable cannot be empty"))]
    pub master_key_env: String,

    /// PBKDF2 iteration count
    #[validate(range(min = 100_000, message = "PBKDF2 iterations must be at least 100000"))]
    pub pbkdf2_iterations: u32,

    /// Days until a stored credential is due for rotation
    #[validate(range(min = 1, max = 3650, message = "Rotation period must be 1-3650 days"))]
    pub rotation_period_days: i64,

    /// Append-only audit log file (None = in-memory only)
    pub audit_log_path: Option<PathBuf>,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            store_path: None,
            master_key_env: "DRIFTWATCH_MASTER_KEY".to_string(),
            pbkdf2_iterations: 210_000,
            rotation_period_days: 90,
            audit_log_path: None,
        }
    }
}

impl VaultSettings {
    /// Rotation period as a chrono duration
    pub fn rotation_period(&self) -> chrono::Duration {
        chrono::Duration::days(self.rotation_period_days)
    }
}

/// Infrastructure control-plane endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the provider API
    #[validate(url(message = "Provider base URL must be a valid URL"))]
    pub base_url: String,

    /// Vault credential id used to authenticate against the provider
    #[validate(length(min = 1, message = "Credential id cannot be empty"))]
    pub credential_id: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8006/api".to_string(),
            credential_id: "provider-api-token".to_string(),
        }
    }
}

/// State collection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CollectorConfig {
    /// Attempts per resource before surfacing a collection failure
    #[validate(range(min = 1, max = 10, message = "Max attempts must be between 1 and 10"))]
    pub max_attempts: u32,

    /// Backoff before the first retry, in milliseconds
    pub base_backoff_ms: u64,

    /// Backoff cap, in milliseconds
    pub max_backoff_ms: u64,

    /// Exponential backoff multiplier
    #[validate(range(min = 1.0, max = 10.0, message = "Multiplier must be between 1 and 10"))]
    pub backoff_multiplier: f64,

    /// Timeout applied to every adapter call, in milliseconds
    #[validate(range(min = 1, message = "Call timeout must be positive"))]
    pub call_timeout_ms: u64,

    /// Maximum resources collected concurrently
    #[validate(range(min = 1, max = 256, message = "Concurrency must be between 1 and 256"))]
    pub max_concurrency: usize,

    /// Provider-to-canonical field normalisation
    pub normalization: NormalizationRules,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 2_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            call_timeout_ms: 10_000,
            max_concurrency: 8,
            normalization: NormalizationRules::default(),
        }
    }
}

impl CollectorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Drift detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DriftConfig {
    /// YAML rule table file
    pub rules_path: Option<PathBuf>,

    /// Inline rule table
    pub rules: Option<SeverityRuleTable>,

    /// Field path patterns whose arrays compare as sets
    pub set_like_fields: Vec<String>,

    /// Scheduled scan cadence in seconds
    #[validate(range(min = 1, message = "Scan interval must be at least one second"))]
    pub scan_interval_secs: u64,

    /// Resources covered by scheduled scans
    pub resources: Vec<String>,

    /// Seconds a remediated or ignored report is kept after it was last seen
    pub closed_report_retention_secs: u64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            rules: None,
            set_like_fields: vec![r"^tags$".to_string(), r"(^|\.)firewall\.rules$".to_string()],
            scan_interval_secs: 900,
            resources: Vec::new(),
            closed_report_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl DriftConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn closed_report_retention(&self) -> chrono::Duration {
        let secs = i64::try_from(self.closed_report_retention_secs).unwrap_or(i64::MAX);
        chrono::Duration::seconds(secs.min(i64::MAX / 1_000))
    }

    /// Resolve the configured rule table (file, inline, or built-in default)
    pub fn load_rules(&self) -> Result<SeverityRuleTable> {
        match (&self.rules_path, &self.rules) {
            (Some(path), _) => SeverityRuleTable::from_yaml_file(path),
            (None, Some(rules)) => Ok(rules.clone()),
            (None, None) => Ok(SeverityRuleTable::default()),
        }
    }
}

/// Remediation policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct RemediationConfig {
    /// Allow automatic fixes for medium-severity drift
    pub auto_fix_enabled: bool,

    /// Field path patterns with a registered automatic fix
    pub auto_fix_paths: Vec<String>,

    /// Notification webhook
    #[validate(url(message = "Webhook URL must be a valid URL"))]
    pub webhook_url: Option<String>,
}

/// Deployment workflow configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Values that must never be deployed
    pub forbidden_values: Vec<ForbiddenValueRule>,

    /// JSON schema every target configuration must satisfy
    pub schema_path: Option<PathBuf>,

    /// Roll back automatically after an apply or verify failure
    pub auto_rollback: bool,

    /// Timeout for adapter calls made by deployment stages, in milliseconds
    #[validate(range(min = 1, message = "Stage timeout must be positive"))]
    pub stage_timeout_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            forbidden_values: Vec::new(),
            schema_path: None,
            auto_rollback: true,
            stage_timeout_ms: 30_000,
        }
    }
}

impl WorkflowConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Load the configured JSON schema, if any
    pub fn load_schema(&self) -> Result<Option<serde_json::Value>> {
        let Some(path) = &self.schema_path else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::io(e, format!("Failed to read schema file {}", path.display()))
        })?;
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL
    #[validate(length(min = 1, message = "Database URL cannot be empty"))]
    pub url: String,

    /// Maximum number of connections in the pool
    #[validate(range(min = 1, max = 100, message = "Max connections must be between 1 and 100"))]
    pub max_connections: u32,

    /// Connection timeout in seconds
    #[validate(range(min = 1, max = 60, message = "Connect timeout must be 1-60 seconds"))]
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/driftwatch.db".to_string(),
            max_connections: 5,
            connect_timeout_seconds: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn is_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Enable the Prometheus exporter
    pub enable_metrics: bool,

    /// Metrics server port (0 = disabled)
    pub metrics_port: u16,

    /// Service name attached to metrics
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
            enable_metrics: false,
            metrics_port: 9464,
            service_name: "driftwatch".to_string(),
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}
