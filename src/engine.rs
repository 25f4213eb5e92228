//! # Engine
//!
//! Wires the vault, baseline store, collector, detector, dispatcher,
//! orchestrator and rollback manager around one shared set of resource
//! locks and one audit log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::adapter::ResourceClient;
use crate::alerts::AlertChannel;
use crate::audit::{AuditEvent, AuditLog};
use crate::baseline::{BaselineStore, SnapshotSource};
use crate::collector::StateCollector;
use crate::config::AppConfig;
use crate::drift::{DriftDetector, DriftReport, DriftReportStore, ScanSummary, Severity};
use crate::errors::Result;
use crate::locks::ResourceLocks;
use crate::remediation::{Action, RemediationDispatcher};
use crate::rollback::{RollbackManager, RollbackResult};
use crate::secrets::SecretsVault;
use crate::workflow::{
    BackupStore, DeploymentContext, DeploymentRun, Environment, RunLedger, WorkflowOrchestrator,
};

/// What the dispatcher did with one report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub report_id: String,
    pub resource_id: String,
    pub severity: Severity,
    pub action: Action,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub summary: ScanSummary,
    pub actions: Vec<DispatchRecord>,
}

pub struct Engine {
    baselines: BaselineStore,
    vault: Arc<SecretsVault>,
    audit: AuditLog,
    locks: ResourceLocks,
    collector: StateCollector,
    detector: Arc<DriftDetector>,
    dispatcher: RemediationDispatcher,
    orchestrator: WorkflowOrchestrator,
    rollback: Arc<RollbackManager>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("orchestrator", &self.orchestrator)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn from_config(
        config: &AppConfig,
        client: Arc<dyn ResourceClient>,
        baselines: BaselineStore,
        vault: Arc<SecretsVault>,
        audit: AuditLog,
        alerts: Arc<dyn AlertChannel>,
    ) -> Result<Self> {
        let locks = ResourceLocks::new();
        let collector = StateCollector::from_config(client.clone(), &config.collector);
        let detector = Arc::new(DriftDetector::from_config(
            &config.drift,
            baselines.clone(),
            collector.clone(),
            DriftReportStore::new(),
            locks.clone(),
        )?);

        let dispatcher = RemediationDispatcher::from_config(
            &config.remediation,
            detector.clone(),
            baselines.clone(),
            client.clone(),
            config.collector.call_timeout(),
            alerts.clone(),
            locks.clone(),
            audit.clone(),
        )?;

        let ctx = DeploymentContext {
            ledger: RunLedger::new(audit.clone()),
            backups: BackupStore::new(),
            baselines: baselines.clone(),
            collector: collector.clone(),
            detector: detector.clone(),
            client,
            alerts,
            locks: locks.clone(),
            audit: audit.clone(),
            stage_timeout: config.workflow.stage_timeout(),
        };
        let rollback = Arc::new(RollbackManager::new(ctx.clone()));
        let orchestrator = WorkflowOrchestrator::from_config(&config.workflow, ctx, rollback.clone())?
            .with_credential_check(vault.clone(), config.provider.credential_id.clone());

        Ok(Self {
            baselines,
            vault,
            audit,
            locks,
            collector,
            detector,
            dispatcher,
            orchestrator,
            rollback,
        })
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn vault(&self) -> &Arc<SecretsVault> {
        &self.vault
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn reports(&self) -> &DriftReportStore {
        self.detector.reports()
    }

    pub fn dispatcher(&self) -> &RemediationDispatcher {
        &self.dispatcher
    }

    pub fn orchestrator(&self) -> &WorkflowOrchestrator {
        &self.orchestrator
    }

    /// Scan `resource_ids` and route every new report. Reports that were
    /// already open before this scan were routed when first seen.
    pub async fn request_scan(&self, resource_ids: &[String]) -> ScanOutcome {
        let summary = self.detector.scan(resource_ids).await;

        let fresh: Vec<DriftReport> = summary
            .reports
            .iter()
            .filter(|r| !summary.repeated.contains(&r.report_id))
            .cloned()
            .collect();
        let mut actions = Vec::with_capacity(fresh.len());
        for report in fresh {
            match self.dispatcher.dispatch(&report).await {
                Ok(action) => actions.push(DispatchRecord {
                    report_id: report.report_id.clone(),
                    resource_id: report.resource_id.clone(),
                    severity: report.severity,
                    action,
                }),
                Err(e) => warn!(
                    report_id = %report.report_id,
                    error = %e,
                    "Failed to dispatch drift report"
                ),
            }
        }

        ScanOutcome { summary, actions }
    }

    /// Capture the current live state of `resource_id` as its new baseline
    #[instrument(skip(self))]
    pub async fn adopt(&self, resource_id: &str, actor: &str) -> Result<u64> {
        let _guard = self.locks.acquire(resource_id).await;

        let live = self.collector.collect(resource_id).await?;
        let revision =
            self.baselines.capture(resource_id, live.config, SnapshotSource::Manual).await?;

        self.audit
            .record(
                AuditEvent::success(actor, "baseline.adopt", resource_id)
                    .with_detail(format!("revision={}", revision)),
            )
            .await?;
        info!(revision, "Adopted live state as baseline");
        Ok(revision)
    }

    pub async fn request_deploy(
        &self,
        resource_id: &str,
        target_revision: u64,
        environment: Environment,
        requested_by: &str,
    ) -> Result<DeploymentRun> {
        self.orchestrator
            .request_deploy(resource_id, target_revision, environment, requested_by)
            .await
    }

    pub async fn approve(&self, run_id: &str, approver: &str) -> Result<DeploymentRun> {
        self.orchestrator.approve(run_id, approver).await
    }

    pub async fn cancel(&self, run_id: &str, actor: &str) -> Result<DeploymentRun> {
        self.orchestrator.cancel(run_id, actor).await
    }

    pub async fn rollback(&self, run_id: &str) -> Result<RollbackResult> {
        self.rollback.rollback(run_id).await
    }
}
