use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn, Instrument};

use super::diff::{diff_configs, SetLikeFields};
use super::report::{Difference, DriftReport, DriftReportStore};
use super::severity::SeverityClassifier;
use crate::adapter::ConfigMap;
use crate::baseline::BaselineStore;
use crate::collector::StateCollector;
use crate::config::DriftConfig;
use crate::errors::{EngineError, ErrorKind, Result};
use crate::locks::ResourceLocks;
use crate::observability::MetricsRecorder;

/// Per-resource failure inside a scan; other resources are unaffected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFailure {
    pub resource_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ScanFailure {
    fn from_error(resource_id: &str, error: &EngineError) -> Self {
        Self { resource_id: resource_id.to_string(), kind: error.kind(), message: error.to_string() }
    }
}

/// Outcome of one scan pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanSummary {
    pub reports: Vec<DriftReport>,
    /// Ids of `reports` that were already open before this scan
    pub repeated: Vec<String>,
    /// Resources that matched their baseline exactly
    pub clean: Vec<String>,
    pub failures: Vec<ScanFailure>,
}

enum ResourceOutcome {
    Report { report: DriftReport, fresh: bool },
    Clean,
    Failed(ScanFailure),
}

/// Compares live state against the current baseline of each resource.
///
/// A resource is never scanned concurrently with itself or with a
/// deployment run: every scan holds the resource lock for its duration.
#[derive(Debug, Clone)]
pub struct DriftDetector {
    baselines: BaselineStore,
    collector: StateCollector,
    classifier: Arc<SeverityClassifier>,
    set_like: Arc<SetLikeFields>,
    reports: DriftReportStore,
    locks: ResourceLocks,
    report_retention: chrono::Duration,
    metrics: MetricsRecorder,
}

impl DriftDetector {
    pub fn new(
        baselines: BaselineStore,
        collector: StateCollector,
        classifier: SeverityClassifier,
        set_like: SetLikeFields,
        reports: DriftReportStore,
        locks: ResourceLocks,
    ) -> Self {
        Self {
            baselines,
            collector,
            classifier: Arc::new(classifier),
            set_like: Arc::new(set_like),
            reports,
            locks,
            report_retention: chrono::Duration::days(7),
            metrics: MetricsRecorder::new(),
        }
    }

    /// How long closed reports are kept after they were last seen
    pub fn with_report_retention(mut self, retention: chrono::Duration) -> Self {
        self.report_retention = retention;
        self
    }

    pub fn from_config(
        config: &DriftConfig,
        baselines: BaselineStore,
        collector: StateCollector,
        reports: DriftReportStore,
        locks: ResourceLocks,
    ) -> Result<Self> {
        let classifier = config.load_rules()?.compile()?;
        let set_like = SetLikeFields::new(&config.set_like_fields)?;
        Ok(Self::new(baselines, collector, classifier, set_like, reports, locks)
            .with_report_retention(config.closed_report_retention()))
    }

    pub fn reports(&self) -> &DriftReportStore {
        &self.reports
    }

    /// Scan a batch of resources with bounded concurrency.
    ///
    /// Reports come back in input order. Clean resources are counted, not
    /// reported, and a collection failure only marks its own resource.
    /// Drift that matches a still-open report reuses that report and is
    /// listed in `repeated`. Closed reports past retention are evicted.
    pub async fn scan(&self, resource_ids: &[String]) -> ScanSummary {
        let span = crate::scan_span!(resource_ids.len());
        let started = Instant::now();

        // Each task owns its detector handle and id so the scan future stays Send
        let mut outcomes = stream::iter(resource_ids.iter().cloned().enumerate())
            .map(|(index, id)| {
                let detector = self.clone();
                async move { (index, detector.scan_resource(&id).await) }
            })
            .buffer_unordered(self.collector.max_concurrency())
            .collect::<Vec<(usize, ResourceOutcome)>>()
            .instrument(span)
            .await;
        outcomes.sort_by_key(|(index, _)| *index);

        let mut summary = ScanSummary::default();
        for ((_, outcome), resource_id) in outcomes.into_iter().zip(resource_ids) {
            match outcome {
                ResourceOutcome::Report { report, fresh } => {
                    if fresh {
                        self.metrics.record_drift_report(report.severity.as_str());
                    } else {
                        summary.repeated.push(report.report_id.clone());
                    }
                    summary.reports.push(report);
                }
                ResourceOutcome::Clean => summary.clean.push(resource_id.clone()),
                ResourceOutcome::Failed(failure) => summary.failures.push(failure),
            }
        }

        if let Some(cutoff) = chrono::Utc::now().checked_sub_signed(self.report_retention) {
            let evicted = self.reports.evict_closed(cutoff);
            if evicted > 0 {
                debug!(evicted, "Evicted closed drift reports");
            }
        }

        self.metrics.record_scan(
            summary.reports.len(),
            summary.clean.len(),
            summary.failures.len(),
            started.elapsed().as_secs_f64(),
        );
        info!(
            reports = summary.reports.len(),
            repeated = summary.repeated.len(),
            clean = summary.clean.len(),
            failures = summary.failures.len(),
            "Drift scan completed"
        );
        summary
    }

    #[instrument(skip(self), fields(resource_id = %resource_id))]
    async fn scan_resource(&self, resource_id: &str) -> ResourceOutcome {
        let _guard = self.locks.acquire(resource_id).await;

        match self.evaluate(resource_id).await {
            Ok(Some(report)) => {
                let (report, fresh) = self.reports.record(report);
                ResourceOutcome::Report { report, fresh }
            }
            Ok(None) => ResourceOutcome::Clean,
            Err(error) => {
                warn!(error = %error, "Resource scan failed");
                ResourceOutcome::Failed(ScanFailure::from_error(resource_id, &error))
            }
        }
    }

    /// Caller must hold the resource lock
    async fn evaluate(&self, resource_id: &str) -> Result<Option<DriftReport>> {
        let Some(baseline) = self.baselines.latest(resource_id).await? else {
            let live = match self.collector.collect(resource_id).await {
                Ok(live) => Some(live),
                Err(error) => {
                    warn!(error = %error, "No baseline and live state unavailable");
                    None
                }
            };
            return Ok(Some(DriftReport::no_baseline(resource_id, live)));
        };

        let live = self.collector.collect(resource_id).await?;
        let differences = self.differences(&baseline.config, &live.config);
        if differences.is_empty() {
            return Ok(None);
        }
        Ok(Some(DriftReport::drift(resource_id, baseline.revision, live, differences)))
    }

    /// Classified differences between an expected config and live state
    pub fn differences(&self, expected: &ConfigMap, live: &ConfigMap) -> Vec<Difference> {
        diff_configs(expected, live, &self.set_like)
            .into_iter()
            .map(|delta| Difference::classify(delta, &self.classifier))
            .collect()
    }

    /// Collect `resource_id` and compare it against `expected`.
    ///
    /// Does not take the resource lock and never stores a report; used by
    /// auto-fix confirmation, deployment verification and rollback.
    pub async fn compare(
        &self,
        resource_id: &str,
        expected: &ConfigMap,
    ) -> Result<Vec<Difference>> {
        let live = self.collector.collect(resource_id).await?;
        Ok(self.differences(expected, &live.config))
    }

    /// Single-attempt [`compare`](Self::compare) under a stage timeout.
    /// Deployment stages treat any collection failure as a hard failure.
    pub async fn verify(
        &self,
        resource_id: &str,
        expected: &ConfigMap,
        timeout: Duration,
    ) -> Result<Vec<Difference>> {
        let live = self.collector.collect_once(resource_id, timeout).await?;
        Ok(self.differences(expected, &live.config))
    }
}
