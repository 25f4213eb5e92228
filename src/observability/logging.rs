//! # Structured Logging
//!
//! Subscriber setup and span helpers built on the tracing ecosystem.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Create a tracing span for a drift scan.
///
/// ```rust,ignore
/// let span = scan_span!(resource_count);
/// let span = scan_span!(resource_count, trigger = "schedule");
/// ```
#[macro_export]
macro_rules! scan_span {
    ($resource_count:expr) => {
        tracing::info_span!(
            "drift_scan",
            scan_id = %uuid::Uuid::new_v4(),
            resource_count = $resource_count
        )
    };
    ($resource_count:expr, $($field:tt)*) => {
        tracing::info_span!(
            "drift_scan",
            scan_id = %uuid::Uuid::new_v4(),
            resource_count = $resource_count,
            $($field)*
        )
    };
}

/// Create a tracing span for a deployment run.
#[macro_export]
macro_rules! deploy_span {
    ($run_id:expr, $resource_id:expr, $environment:expr) => {
        tracing::info_span!(
            "deployment_run",
            run_id = %$run_id,
            resource_id = %$resource_id,
            environment = %$environment
        )
    };
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns `false` when a
/// subscriber was already installed (tests, embedding applications).
pub fn init_logging(config: &ObservabilityConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_logging {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    result.is_ok()
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        provider = %config.provider.base_url,
        scan_interval_secs = config.drift.scan_interval_secs,
        scheduled_resources = config.drift.resources.len(),
        max_concurrency = config.collector.max_concurrency,
        auto_fix_enabled = config.remediation.auto_fix_enabled,
        auto_rollback = config.workflow.auto_rollback,
        metrics_enabled = config.observability.enable_metrics,
        "Driftwatch engine configuration"
    );
}
