//! # Metrics Collection
//!
//! Engine metrics on the `metrics` facade. Without an installed recorder every
//! call is a no-op, so components record unconditionally.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

use crate::config::ObservabilityConfig;
use crate::errors::Result;

/// Metrics recorder that tracks engine activity
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of one scan pass
    pub fn record_scan(&self, reports: usize, clean: usize, failures: usize, duration: f64) {
        counter!("drift_scans_total").increment(1);
        counter!("drift_scan_clean_resources_total").increment(clean as u64);
        counter!("drift_scan_failures_total").increment(failures as u64);
        counter!("drift_scan_reports_emitted_total").increment(reports as u64);
        histogram!("drift_scan_duration_seconds").record(duration);
    }

    /// Record a drift report by severity
    pub fn record_drift_report(&self, severity: &str) {
        let labels = [("severity", severity.to_string())];
        counter!("drift_reports_total", &labels).increment(1);
    }

    /// Record a collection retry for a resource
    pub fn record_collection_retry(&self, attempt: u32) {
        let labels = [("attempt", attempt.to_string())];
        counter!("collector_retries_total", &labels).increment(1);
    }

    /// Record a remediation action
    pub fn record_dispatch(&self, action: &str, severity: &str) {
        let labels = [("action", action.to_string()), ("severity", severity.to_string())];
        counter!("remediation_actions_total", &labels).increment(1);
    }

    /// Record a deployment stage transition
    pub fn record_stage_transition(&self, environment: &str, stage: &str) {
        let labels = [("environment", environment.to_string()), ("stage", stage.to_string())];
        counter!("deployment_stage_transitions_total", &labels).increment(1);
    }

    /// Record a vault operation outcome
    pub fn record_vault_operation(&self, operation: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        let labels = [("operation", operation.to_string()), ("outcome", outcome.to_string())];
        counter!("vault_operations_total", &labels).increment(1);
    }

    /// Record a rollback outcome
    pub fn record_rollback(&self, success: bool) {
        let outcome = if success { "rolled_back" } else { "failed" };
        let labels = [("outcome", outcome.to_string())];
        counter!("rollbacks_total", &labels).increment(1);
    }

    /// Describe all engine metrics for the exporter
    pub fn describe(&self) {
        describe_counter!("drift_scans_total", "Completed drift scan passes");
        describe_counter!(
            "drift_scan_clean_resources_total",
            "Resources scanned with zero differences"
        );
        describe_counter!("drift_scan_failures_total", "Resources whose collection failed");
        describe_counter!("drift_reports_total", "Drift reports by severity");
        describe_histogram!("drift_scan_duration_seconds", Unit::Seconds, "Scan pass duration");
        describe_counter!("collector_retries_total", "Adapter retries during collection");
        describe_counter!("remediation_actions_total", "Remediation dispatch outcomes");
        describe_counter!("deployment_stage_transitions_total", "Deployment stage transitions");
        describe_counter!("vault_operations_total", "Secrets vault operations");
        describe_counter!("rollbacks_total", "Rollback outcomes");
    }
}

/// Install the Prometheus exporter when enabled
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    use crate::errors::EngineError;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    if !config.enable_metrics {
        return Ok(());
    }

    let Some(metrics_addr) = config.metrics_bind_address() else {
        tracing::warn!("Metrics disabled: no bind address configured");
        return Ok(());
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        EngineError::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| {
            EngineError::config(format!("Failed to initialize metrics exporter: {}", e))
        })?;

    MetricsRecorder::new().describe();

    tracing::info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(())
}

/// Without the exporter feature the facade stays a no-op
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if config.enable_metrics {
        tracing::warn!("Metrics requested but the prometheus feature is disabled");
    }
    Ok(())
}
