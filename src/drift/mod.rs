//! # Drift Detection
//!
//! Structural diff of live state against the current baseline, rule-based
//! severity classification, and the report store the remediation
//! dispatcher works from.

pub mod detector;
pub mod diff;
pub mod report;
pub mod severity;

pub use detector::{DriftDetector, ScanFailure, ScanSummary};
pub use diff::{diff_configs, FieldDelta, SetLikeFields};
pub use report::{Difference, DriftReason, DriftReport, DriftReportStore, ReportStatus};
pub use severity::{Severity, SeverityClassifier, SeverityRule, SeverityRuleTable};
