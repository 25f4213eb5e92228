//! # Configuration Management
//!
//! Layered configuration: built-in defaults, then an optional YAML/TOML file,
//! then `DRIFTWATCH__SECTION__KEY` environment overrides.

pub mod settings;

use std::path::Path;

pub use settings::{
    AppConfig, CollectorConfig, DatabaseConfig, DriftConfig, ObservabilityConfig, ProviderConfig,
    RemediationConfig, VaultSettings, WorkflowConfig,
};

use crate::errors::Result;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "DRIFTWATCH";

impl AppConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&AppConfig::default())?;
        let mut builder = ::config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let app_config: AppConfig = builder.build()?.try_deserialize()?;
        app_config.validate()?;

        tracing::debug!(
            config_file = ?path,
            scan_interval_secs = app_config.drift.scan_interval_secs,
            max_concurrency = app_config.collector.max_concurrency,
            "Configuration loaded"
        );

        Ok(app_config)
    }
}
