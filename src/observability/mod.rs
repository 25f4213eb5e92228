//! # Observability Infrastructure
//!
//! Structured logging and metrics for the engine.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, log_config_info};
pub use metrics::{init_metrics, MetricsRecorder};

use crate::config::ObservabilityConfig;
use crate::errors::Result;

/// Initialize logging and, when enabled, the metrics exporter
pub fn init_observability(config: &ObservabilityConfig) -> Result<()> {
    let installed = init_logging(config);
    init_metrics(config)?;

    ::tracing::info!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        json_logging = config.json_logging,
        metrics_enabled = config.enable_metrics,
        subscriber_installed = installed,
        "Observability initialized"
    );

    Ok(())
}
