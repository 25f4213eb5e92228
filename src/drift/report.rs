//! Drift reports and their store.
//!
//! Reports are created by the detector and afterwards only change status.
//! Status changes are compare-and-set so two writers racing on one report
//! cannot both succeed; only the remediation dispatcher issues them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::diff::FieldDelta;
use super::severity::{Severity, SeverityClassifier};
use crate::collector::LiveStateRecord;
use crate::errors::{EngineError, Result};

/// A classified field discrepancy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Difference {
    pub field_path: String,
    pub baseline_value: Option<Value>,
    pub live_value: Option<Value>,
    pub severity: Severity,
}

impl Difference {
    pub fn classify(delta: FieldDelta, classifier: &SeverityClassifier) -> Self {
        Self {
            severity: classifier.classify(&delta.field_path),
            field_path: delta.field_path,
            baseline_value: delta.baseline_value,
            live_value: delta.live_value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftReason {
    Drift,
    NoBaseline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Open,
    Acknowledged,
    Remediated,
    Ignored,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Open => "open",
            ReportStatus::Acknowledged => "acknowledged",
            ReportStatus::Remediated => "remediated",
            ReportStatus::Ignored => "ignored",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ReportStatus::Remediated | ReportStatus::Ignored)
    }

    pub fn can_transition_to(&self, next: ReportStatus) -> bool {
        matches!(
            (self, next),
            (ReportStatus::Open, ReportStatus::Acknowledged)
                | (ReportStatus::Open, ReportStatus::Remediated)
                | (ReportStatus::Open, ReportStatus::Ignored)
                | (ReportStatus::Acknowledged, ReportStatus::Remediated)
                | (ReportStatus::Acknowledged, ReportStatus::Ignored)
        )
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub report_id: String,
    pub resource_id: String,
    /// Revision compared against; `None` when the resource has no baseline
    pub baseline_revision: Option<u64>,
    /// Live state used as evidence; absent if it could not be collected
    pub live_snapshot: Option<LiveStateRecord>,
    pub differences: Vec<Difference>,
    pub severity: Severity,
    pub reason: DriftReason,
    pub detected_at: DateTime<Utc>,
    /// Latest scan that found this same drift
    pub last_seen_at: DateTime<Utc>,
    pub status: ReportStatus,
}

impl DriftReport {
    pub(crate) fn drift(
        resource_id: &str,
        baseline_revision: u64,
        live: LiveStateRecord,
        differences: Vec<Difference>,
    ) -> Self {
        let severity = differences.iter().map(|d| d.severity).max().unwrap_or_default();
        let now = Utc::now();
        Self {
            report_id: uuid::Uuid::new_v4().to_string(),
            resource_id: resource_id.to_string(),
            baseline_revision: Some(baseline_revision),
            live_snapshot: Some(live),
            differences,
            severity,
            reason: DriftReason::Drift,
            detected_at: now,
            last_seen_at: now,
            status: ReportStatus::Open,
        }
    }

    pub(crate) fn no_baseline(resource_id: &str, live: Option<LiveStateRecord>) -> Self {
        let now = Utc::now();
        Self {
            report_id: uuid::Uuid::new_v4().to_string(),
            resource_id: resource_id.to_string(),
            baseline_revision: None,
            live_snapshot: live,
            differences: Vec::new(),
            severity: Severity::Medium,
            reason: DriftReason::NoBaseline,
            detected_at: now,
            last_seen_at: now,
            status: ReportStatus::Open,
        }
    }

    /// Same resource, baseline, reason and differences
    fn describes_same_drift(&self, other: &DriftReport) -> bool {
        self.resource_id == other.resource_id
            && self.baseline_revision == other.baseline_revision
            && self.reason == other.reason
            && self.differences == other.differences
    }

    /// Short operator-facing description
    pub fn summary(&self) -> String {
        match self.reason {
            DriftReason::NoBaseline => {
                format!("{} has no baseline snapshot", self.resource_id)
            }
            DriftReason::Drift => {
                let fields: Vec<&str> =
                    self.differences.iter().take(5).map(|d| d.field_path.as_str()).collect();
                let more = self.differences.len().saturating_sub(fields.len());
                let suffix = if more > 0 { format!(" (+{} more)", more) } else { String::new() };
                format!(
                    "{} drifted from baseline r{} in {}{}",
                    self.resource_id,
                    self.baseline_revision.unwrap_or_default(),
                    fields.join(", "),
                    suffix
                )
            }
        }
    }
}

/// In-memory drift report store
#[derive(Debug, Clone, Default)]
pub struct DriftReportStore {
    reports: Arc<DashMap<String, DriftReport>>,
}

impl DriftReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, report: DriftReport) {
        self.reports.insert(report.report_id.clone(), report);
    }

    /// Store `report` unless an unclosed report already describes the same
    /// drift; that report then takes the new evidence and is returned with
    /// `false`. Callers serialise scans of one resource.
    pub(crate) fn record(&self, report: DriftReport) -> (DriftReport, bool) {
        let existing = self
            .reports
            .iter()
            .find(|r| !r.status.is_closed() && r.describes_same_drift(&report))
            .map(|r| r.report_id.clone());

        if let Some(report_id) = existing {
            if let Some(mut entry) = self.reports.get_mut(&report_id) {
                entry.last_seen_at = report.detected_at;
                if report.live_snapshot.is_some() {
                    entry.live_snapshot = report.live_snapshot;
                }
                return (entry.clone(), false);
            }
        }
        self.insert(report.clone());
        (report, true)
    }

    /// Drop closed reports last seen before `cutoff`; returns how many went
    pub fn evict_closed(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.reports.len();
        self.reports.retain(|_, r| !(r.status.is_closed() && r.last_seen_at < cutoff));
        before.saturating_sub(self.reports.len())
    }

    pub fn get(&self, report_id: &str) -> Result<DriftReport> {
        self.reports
            .get(report_id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::not_found("drift_report", report_id))
    }

    /// Reports for one resource, oldest first
    pub fn list_for_resource(&self, resource_id: &str) -> Vec<DriftReport> {
        let mut reports: Vec<DriftReport> = self
            .reports
            .iter()
            .filter(|r| r.resource_id == resource_id)
            .map(|r| r.clone())
            .collect();
        reports.sort_by_key(|r| r.detected_at);
        reports
    }

    /// Reports awaiting action, most severe first
    pub fn open_reports(&self) -> Vec<DriftReport> {
        let mut reports: Vec<DriftReport> = self
            .reports
            .iter()
            .filter(|r| !r.status.is_closed())
            .map(|r| r.clone())
            .collect();
        reports.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.detected_at.cmp(&b.detected_at)));
        reports
    }

    /// Compare-and-set status change: succeeds only if the report is still
    /// in `expected`.
    pub(crate) fn transition(
        &self,
        report_id: &str,
        expected: ReportStatus,
        next: ReportStatus,
    ) -> Result<DriftReport> {
        let mut entry = self
            .reports
            .get_mut(report_id)
            .ok_or_else(|| EngineError::not_found("drift_report", report_id))?;

        if entry.status != expected {
            return Err(EngineError::conflict(
                &entry.resource_id,
                format!(
                    "report {} is {}, expected {}",
                    report_id, entry.status, expected
                ),
            ));
        }
        if !expected.can_transition_to(next) {
            return Err(EngineError::validation(format!(
                "report {} cannot move from {} to {}",
                report_id, expected, next
            )));
        }

        entry.status = next;
        Ok(entry.clone())
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn difference(path: &str, severity: Severity) -> Difference {
        Difference {
            field_path: path.to_string(),
            baseline_value: Some(json!(1)),
            live_value: Some(json!(2)),
            severity,
        }
    }

    fn live(resource_id: &str) -> LiveStateRecord {
        LiveStateRecord {
            resource_id: resource_id.to_string(),
            config: serde_json::Map::new(),
            collected_at: Utc::now(),
        }
    }

    #[test]
    fn test_report_severity_is_maximum() {
        let report = DriftReport::drift(
            "vm-1",
            3,
            live("vm-1"),
            vec![difference("cpu", Severity::Medium), difference("network.public", Severity::Critical)],
        );
        assert_eq!(report.severity, Severity::Critical);
        assert_eq!(report.reason, DriftReason::Drift);
        assert!(report.summary().contains("r3"));
    }

    #[test]
    fn test_no_baseline_report() {
        let report = DriftReport::no_baseline("vm-42", None);
        assert_eq!(report.severity, Severity::Medium);
        assert_eq!(report.reason, DriftReason::NoBaseline);
        assert_eq!(serde_json::to_value(report.reason).unwrap(), json!("NO_BASELINE"));
    }

    #[test]
    fn test_compare_and_set_transition() {
        let store = DriftReportStore::new();
        let report = DriftReport::drift("vm-1", 1, live("vm-1"), vec![difference("cpu", Severity::Medium)]);
        let id = report.report_id.clone();
        store.insert(report);

        store.transition(&id, ReportStatus::Open, ReportStatus::Acknowledged).unwrap();
        let stale = store.transition(&id, ReportStatus::Open, ReportStatus::Ignored);
        assert!(matches!(stale, Err(EngineError::Conflict { .. })));

        store.transition(&id, ReportStatus::Acknowledged, ReportStatus::Remediated).unwrap();
        assert!(store.open_reports().is_empty());
        let reopen = store.transition(&id, ReportStatus::Remediated, ReportStatus::Open);
        assert!(reopen.is_err());
    }

    #[test]
    fn test_queries() {
        let store = DriftReportStore::new();
        store.insert(DriftReport::drift("vm-1", 1, live("vm-1"), vec![difference("tags", Severity::Low)]));
        store.insert(DriftReport::no_baseline("vm-2", None));

        assert_eq!(store.list_for_resource("vm-1").len(), 1);
        let open = store.open_reports();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].resource_id, "vm-2");
        assert!(store.get("missing").is_err());
    }

    #[test]
    fn test_repeated_drift_folds_into_open_report() {
        let store = DriftReportStore::new();
        let first = DriftReport::drift("vm-1", 1, live("vm-1"), vec![difference("cpu", Severity::Medium)]);
        let (stored, fresh) = store.record(first.clone());
        assert!(fresh);

        let again = DriftReport::drift("vm-1", 1, live("vm-1"), vec![difference("cpu", Severity::Medium)]);
        let (folded, fresh) = store.record(again.clone());
        assert!(!fresh);
        assert_eq!(folded.report_id, stored.report_id);
        assert_eq!(folded.last_seen_at, again.detected_at);
        assert_eq!(store.len(), 1);

        // Different drift, or a closed predecessor, starts a new report
        let other = DriftReport::drift("vm-1", 1, live("vm-1"), vec![difference("memory", Severity::Medium)]);
        assert!(store.record(other).1);
        store.transition(&stored.report_id, ReportStatus::Open, ReportStatus::Ignored).unwrap();
        assert!(store.record(again).1);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_evict_closed_keeps_open_reports() {
        let store = DriftReportStore::new();
        let closed = DriftReport::drift("vm-1", 1, live("vm-1"), vec![difference("cpu", Severity::Low)]);
        let open = DriftReport::no_baseline("vm-2", None);
        let closed_id = closed.report_id.clone();
        store.insert(closed);
        store.insert(open.clone());
        store.transition(&closed_id, ReportStatus::Open, ReportStatus::Remediated).unwrap();

        assert_eq!(store.evict_closed(Utc::now() - chrono::Duration::hours(1)), 0);
        assert_eq!(store.evict_closed(Utc::now() + chrono::Duration::seconds(1)), 1);
        assert!(store.get(&closed_id).is_err());
        assert!(store.get(&open.report_id).is_ok());
    }
}
