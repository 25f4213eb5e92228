//! # Remediation Dispatcher
//!
//! Routes each drift report by severity:
//!
//! - `critical` / `high`: alert and hold for a human
//! - `medium`: alert; auto-fix when policy allows it for every differing
//!   field path
//! - `low`: log only
//!
//! An auto-fix re-applies the current baseline and re-scans the resource
//! once. If drift remains the report is held; there is no second attempt.
//!
//! The dispatcher is the only writer of report status.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::adapter::{call_with_timeout, ResourceClient};
use crate::alerts::{notify, Alert, AlertChannel, AlertSource};
use crate::audit::{AuditEvent, AuditLog};
use crate::baseline::BaselineStore;
use crate::config::RemediationConfig;
use crate::drift::{
    Difference, DriftDetector, DriftReason, DriftReport, ReportStatus, Severity,
};
use crate::errors::{EngineError, Result};
use crate::locks::ResourceLocks;
use crate::observability::MetricsRecorder;

const ACTOR: &str = "remediation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Alerted,
    AutoFixed,
    Held,
    Logged,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Alerted => "alerted",
            Action::AutoFixed => "auto_fixed",
            Action::Held => "held",
            Action::Logged => "logged",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field path patterns that have a registered automatic fix
#[derive(Debug, Clone, Default)]
pub struct AutoRemediationRegistry {
    patterns: Vec<Regex>,
}

impl AutoRemediationRegistry {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut registry = Self::default();
        for pattern in patterns {
            registry.register(pattern.as_ref())?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, pattern: &str) -> Result<()> {
        let regex = Regex::new(pattern).map_err(|e| {
            EngineError::validation_field(
                format!("Invalid auto-fix pattern '{}': {}", pattern, e),
                "remediation.auto_fix_paths",
            )
        })?;
        self.patterns.push(regex);
        Ok(())
    }

    pub fn covers(&self, field_path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(field_path))
    }

    /// True when every difference has a registered fix
    pub fn covers_all(&self, differences: &[Difference]) -> bool {
        differences.iter().all(|d| self.covers(&d.field_path))
    }
}

pub struct RemediationDispatcher {
    detector: Arc<DriftDetector>,
    baselines: BaselineStore,
    client: Arc<dyn ResourceClient>,
    registry: AutoRemediationRegistry,
    auto_fix_enabled: bool,
    apply_timeout: Duration,
    alerts: Arc<dyn AlertChannel>,
    locks: ResourceLocks,
    audit: AuditLog,
    metrics: MetricsRecorder,
}

impl fmt::Debug for RemediationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemediationDispatcher")
            .field("registry", &self.registry)
            .field("auto_fix_enabled", &self.auto_fix_enabled)
            .finish_non_exhaustive()
    }
}

impl RemediationDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        detector: Arc<DriftDetector>,
        baselines: BaselineStore,
        client: Arc<dyn ResourceClient>,
        registry: AutoRemediationRegistry,
        auto_fix_enabled: bool,
        apply_timeout: Duration,
        alerts: Arc<dyn AlertChannel>,
        locks: ResourceLocks,
        audit: AuditLog,
    ) -> Self {
        Self {
            detector,
            baselines,
            client,
            registry,
            auto_fix_enabled,
            apply_timeout,
            alerts,
            locks,
            audit,
            metrics: MetricsRecorder::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_config(
        config: &RemediationConfig,
        detector: Arc<DriftDetector>,
        baselines: BaselineStore,
        client: Arc<dyn ResourceClient>,
        apply_timeout: Duration,
        alerts: Arc<dyn AlertChannel>,
        locks: ResourceLocks,
        audit: AuditLog,
    ) -> Result<Self> {
        let registry = AutoRemediationRegistry::new(&config.auto_fix_paths)?;
        Ok(Self::new(
            detector,
            baselines,
            client,
            registry,
            config.auto_fix_enabled,
            apply_timeout,
            alerts,
            locks,
            audit,
        ))
    }

    /// Route one report according to policy
    #[instrument(skip_all, fields(report_id = %report.report_id, resource_id = %report.resource_id))]
    pub async fn dispatch(&self, report: &DriftReport) -> Result<Action> {
        if report.status.is_closed() {
            return Err(EngineError::validation(format!(
                "report {} is already {}",
                report.report_id, report.status
            )));
        }

        let action = match report.severity {
            Severity::Critical | Severity::High => {
                self.alert(report, format!("HELD for approval: {}", report.summary())).await;
                Action::Held
            }
            Severity::Medium => {
                self.alert(report, report.summary()).await;
                if self.auto_fix_eligible(report) {
                    self.auto_fix(report).await
                } else {
                    Action::Alerted
                }
            }
            Severity::Low => {
                info!(summary = %report.summary(), "Low severity drift logged");
                Action::Logged
            }
        };

        self.metrics.record_dispatch(action.as_str(), report.severity.as_str());
        info!(action = %action, severity = %report.severity, "Drift report dispatched");
        Ok(action)
    }

    fn auto_fix_eligible(&self, report: &DriftReport) -> bool {
        self.auto_fix_enabled
            && report.reason == DriftReason::Drift
            && !report.differences.is_empty()
            && self.registry.covers_all(&report.differences)
    }

    /// Re-apply the baseline once and confirm convergence
    async fn auto_fix(&self, report: &DriftReport) -> Action {
        let resource_id = report.resource_id.as_str();
        let _guard = self.locks.acquire(resource_id).await;

        let outcome = match self.try_auto_fix(report).await {
            // A converged fix that cannot be audited is held like a failed one
            Ok(()) => self
                .audit
                .record(AuditEvent::success(ACTOR, "remediation.auto_fix", resource_id))
                .await,
            Err(error) => {
                if let Err(e) = self
                    .audit
                    .record(AuditEvent::failure(
                        ACTOR,
                        "remediation.auto_fix",
                        resource_id,
                        error.to_string(),
                    ))
                    .await
                {
                    error!(
                        resource_id = %resource_id,
                        error = %e,
                        "Failed to audit auto-fix failure"
                    );
                }
                Err(error)
            }
        };

        match outcome {
            Ok(()) => {
                let status = self
                    .detector
                    .reports()
                    .get(&report.report_id)
                    .map(|r| r.status)
                    .unwrap_or(ReportStatus::Open);
                if let Err(e) = self.detector.reports().transition(
                    &report.report_id,
                    status,
                    ReportStatus::Remediated,
                ) {
                    warn!(error = %e, "Report status changed during auto-fix");
                }
                info!(resource_id = %resource_id, "Auto-fix converged");
                Action::AutoFixed
            }
            Err(error) => {
                warn!(resource_id = %resource_id, error = %error, "Auto-fix failed, holding report");
                let alert = Alert::new(
                    AlertSource::DriftReport,
                    report.severity,
                    resource_id,
                    &report.report_id,
                    format!("HELD after failed auto-fix: {}", report.summary()),
                )
                .with_error(&error);
                notify(self.alerts.as_ref(), alert).await;
                Action::Held
            }
        }
    }

    /// Caller holds the resource lock
    async fn try_auto_fix(&self, report: &DriftReport) -> Result<()> {
        let resource_id = report.resource_id.as_str();
        let baseline = self.baselines.current(resource_id).await?;
        if Some(baseline.revision) != report.baseline_revision {
            return Err(EngineError::conflict(
                resource_id,
                format!(
                    "baseline moved to r{} since the report was taken",
                    baseline.revision
                ),
            ));
        }

        // Live state may have changed since the scan; never revert fields
        // without a registered fix.
        let pending = self.detector.compare(resource_id, &baseline.config).await?;
        if !self.registry.covers_all(&pending) {
            return Err(EngineError::validation(format!(
                "drift on {} now includes fields without an automatic fix",
                resource_id
            )));
        }

        call_with_timeout(self.apply_timeout, self.client.apply_state(resource_id, &baseline.config))
            .await
            .map_err(|e| e.into_engine_error(resource_id))?;

        let residual = self.detector.compare(resource_id, &baseline.config).await?;
        if !residual.is_empty() {
            return Err(EngineError::consistency(resource_id, residual.len()));
        }
        Ok(())
    }

    async fn alert(&self, report: &DriftReport, summary: String) {
        let alert = Alert::new(
            AlertSource::DriftReport,
            report.severity,
            &report.resource_id,
            &report.report_id,
            summary,
        );
        notify(self.alerts.as_ref(), alert).await;
    }

    async fn set_status(
        &self,
        report_id: &str,
        allowed_from: &[ReportStatus],
        next: ReportStatus,
        actor: &str,
    ) -> Result<DriftReport> {
        let current = self.detector.reports().get(report_id)?;
        if !allowed_from.contains(&current.status) {
            return Err(EngineError::validation(format!(
                "report {} is {}, cannot become {}",
                report_id, current.status, next
            )));
        }

        self.audit
            .record(
                AuditEvent::success(actor, format!("report.{}", next.as_str()), &current.resource_id)
                    .with_detail(format!("report_id={}", report_id)),
            )
            .await?;
        self.detector.reports().transition(report_id, current.status, next)
    }

    pub async fn acknowledge(&self, report_id: &str, actor: &str) -> Result<DriftReport> {
        self.set_status(report_id, &[ReportStatus::Open], ReportStatus::Acknowledged, actor).await
    }

    pub async fn ignore(&self, report_id: &str, actor: &str) -> Result<DriftReport> {
        self.set_status(
            report_id,
            &[ReportStatus::Open, ReportStatus::Acknowledged],
            ReportStatus::Ignored,
            actor,
        )
        .await
    }

    pub async fn mark_remediated(&self, report_id: &str, actor: &str) -> Result<DriftReport> {
        self.set_status(
            report_id,
            &[ReportStatus::Open, ReportStatus::Acknowledged],
            ReportStatus::Remediated,
            actor,
        )
        .await
    }
}
