//! # Rollback Manager
//!
//! Restores the pre-run backup of a failed deployment and verifies it the
//! same way the orchestrator verifies an apply. Only the most recent run of
//! a resource can be rolled back, and only once: a rollback that does not
//! verify leaves the run `failed` and raises a critical alert for manual
//! intervention.

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::adapter::{call_with_timeout, ConfigMap};
use crate::alerts::{Alert, AlertSource};
use crate::audit::AuditEvent;
use crate::drift::{Difference, Severity};
use crate::errors::{EngineError, Result};
use crate::observability::MetricsRecorder;
use crate::workflow::{DeploymentContext, RunFailure, RunStage};

const ACTOR: &str = "rollback";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub run_id: String,
    /// Live state matches the backup again
    pub restored: bool,
    /// Differences left after re-applying the backup
    pub residual: Vec<Difference>,
    pub failure: Option<RunFailure>,
}

pub struct RollbackManager {
    ctx: DeploymentContext,
    metrics: MetricsRecorder,
}

impl std::fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackManager").finish_non_exhaustive()
    }
}

impl RollbackManager {
    pub fn new(ctx: DeploymentContext) -> Self {
        Self { ctx, metrics: MetricsRecorder::new() }
    }

    pub async fn rollback(&self, run_id: &str) -> Result<RollbackResult> {
        let run = self.ctx.ledger.get(run_id)?;
        let _guard = self.ctx.locks.acquire(&run.resource_id).await;
        self.rollback_locked(run_id).await
    }

    /// Caller holds the resource lock
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub(crate) async fn rollback_locked(&self, run_id: &str) -> Result<RollbackResult> {
        let run = self.ctx.ledger.get(run_id)?;

        if run.stage != RunStage::Failed {
            return Err(EngineError::invalid_transition(run_id, run.stage, RunStage::RolledBack));
        }
        let Some(backup_ref) = run.backup_ref.clone() else {
            return Err(EngineError::validation(format!("Run {} has no backup", run_id)));
        };
        if run.rollback_attempted {
            return Err(EngineError::validation(format!(
                "Rollback of run {} was already attempted",
                run_id
            )));
        }
        let latest = self.ctx.ledger.latest_for(&run.resource_id);
        if latest.as_ref().map(|r| r.run_id.as_str()) != Some(run_id) {
            return Err(EngineError::conflict(
                &run.resource_id,
                format!("run {} is not the most recent run", run_id),
            ));
        }

        let backup = self.ctx.backups.get(&backup_ref)?;
        self.ctx.ledger.update(run_id, |r| r.rollback_attempted = true)?;

        let outcome = self.restore(&run.resource_id, &backup.config).await;

        match outcome {
            Ok(residual) if residual.is_empty() => {
                self.ctx.ledger.transition(run_id, RunStage::RolledBack, ACTOR).await?;
                self.metrics.record_rollback(true);
                info!(backup_ref = %backup_ref, "Rollback restored pre-run state");
                Ok(RollbackResult {
                    run_id: run_id.to_string(),
                    restored: true,
                    residual,
                    failure: None,
                })
            }
            Ok(residual) => {
                let error = EngineError::consistency(&run.resource_id, residual.len());
                let failure = self.rollback_failed(&run.resource_id, run_id, &error).await?;
                Ok(RollbackResult {
                    run_id: run_id.to_string(),
                    restored: false,
                    residual,
                    failure: Some(failure),
                })
            }
            Err(error) => {
                let failure = self.rollback_failed(&run.resource_id, run_id, &error).await?;
                Ok(RollbackResult {
                    run_id: run_id.to_string(),
                    restored: false,
                    residual: Vec::new(),
                    failure: Some(failure),
                })
            }
        }
    }

    async fn restore(&self, resource_id: &str, config: &ConfigMap) -> Result<Vec<Difference>> {
        call_with_timeout(self.ctx.stage_timeout, self.ctx.client.apply_state(resource_id, config))
            .await
            .map_err(|e| e.into_engine_error(resource_id))?;
        self.ctx.detector.verify(resource_id, config, self.ctx.stage_timeout).await
    }

    /// Record and alert a rollback that did not restore the backup. The
    /// critical alert goes out even when the audit append fails.
    async fn rollback_failed(
        &self,
        resource_id: &str,
        run_id: &str,
        error: &EngineError,
    ) -> Result<RunFailure> {
        let failure = RunFailure {
            stage: RunStage::Failed,
            kind: error.kind(),
            message: format!("rollback failed: {}", error),
        };
        if let Err(e) = self.ctx.ledger.update(run_id, |r| r.failure = Some(failure.clone())) {
            error!(error = %e, "Failed to record rollback failure on run");
        }

        self.metrics.record_rollback(false);
        let audited = self
            .ctx
            .audit
            .record(AuditEvent::failure(ACTOR, "run.rollback", run_id, error.to_string()))
            .await;
        self.ctx
            .alert(
                Alert::new(
                    AlertSource::Rollback,
                    Severity::Critical,
                    resource_id,
                    run_id,
                    format!(
                        "Rollback of {} did not restore the backup; manual action required",
                        resource_id
                    ),
                )
                .with_error(error),
            )
            .await;
        error!(resource_id = %resource_id, error = %error, "Rollback failed");
        audited?;
        Ok(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::adapter::{AdapterError, InMemoryResourceClient};
    use crate::alerts::RecordingAlertChannel;
    use crate::audit::AuditLog;
    use crate::baseline::{BaselineStore, SnapshotSource};
    use crate::collector::{RetryPolicy, StateCollector};
    use crate::config::DriftConfig;
    use crate::drift::{DriftDetector, DriftReportStore};
    use crate::errors::ErrorKind;
    use crate::locks::ResourceLocks;
    use crate::workflow::{
        BackupStore, ConfigValidator, Environment, RunLedger, WorkflowOrchestrator,
    };
    use serde_json::json;

    struct Fixture {
        client: Arc<InMemoryResourceClient>,
        baselines: BaselineStore,
        alerts: RecordingAlertChannel,
        rollback: Arc<RollbackManager>,
        orchestrator: WorkflowOrchestrator,
    }

    fn fixture() -> Fixture {
        let client = Arc::new(InMemoryResourceClient::new());
        let baselines = BaselineStore::in_memory();
        let locks = ResourceLocks::new();
        let audit = AuditLog::in_memory();
        let collector =
            StateCollector::new(client.clone(), RetryPolicy::none(), Duration::from_secs(1));
        let detector = DriftDetector::from_config(
            &DriftConfig::default(),
            baselines.clone(),
            collector.clone(),
            DriftReportStore::new(),
            locks.clone(),
        )
        .unwrap();
        let alerts = RecordingAlertChannel::new();
        let ctx = DeploymentContext {
            ledger: RunLedger::new(audit.clone()),
            backups: BackupStore::new(),
            baselines: baselines.clone(),
            collector,
            detector: Arc::new(detector),
            client: client.clone(),
            alerts: Arc::new(alerts.clone()),
            locks,
            audit,
            stage_timeout: Duration::from_millis(500),
        };
        let rollback = Arc::new(RollbackManager::new(ctx.clone()));
        let orchestrator =
            WorkflowOrchestrator::new(ctx, ConfigValidator::default(), rollback.clone(), false);
        Fixture { client, baselines, alerts, rollback, orchestrator }
    }

    fn config(value: serde_json::Value) -> ConfigMap {
        value.as_object().cloned().unwrap()
    }

    async fn failed_run(f: &Fixture) -> String {
        f.client.set_state("vm-1", json!({"cpu": 2}));
        let revision = f
            .baselines
            .capture("vm-1", config(json!({"cpu": 4})), SnapshotSource::Manual)
            .await
            .unwrap();
        f.client.fail_after_apply("vm-1");
        let run =
            f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
        assert_eq!(run.stage, RunStage::Failed);
        run.run_id
    }

    #[tokio::test]
    async fn test_rollback_restores_backup() {
        let f = fixture();
        let run_id = failed_run(&f).await;
        assert_eq!(f.client.state("vm-1"), Some(config(json!({"cpu": 4}))));

        let result = f.rollback.rollback(&run_id).await.unwrap();
        assert!(result.restored);
        assert!(result.residual.is_empty());
        assert_eq!(f.client.state("vm-1"), Some(config(json!({"cpu": 2}))));
        assert_eq!(f.orchestrator.get_run(&run_id).unwrap().stage, RunStage::RolledBack);
    }

    #[tokio::test]
    async fn test_rollback_only_once() {
        let f = fixture();
        let run_id = failed_run(&f).await;
        f.client.fail_applies("vm-1", AdapterError::unavailable("503"));

        let result = f.rollback.rollback(&run_id).await.unwrap();
        assert!(!result.restored);
        assert_eq!(result.failure.as_ref().unwrap().kind, ErrorKind::Transient);

        let run = f.orchestrator.get_run(&run_id).unwrap();
        assert_eq!(run.stage, RunStage::Failed);
        assert!(run.rollback_attempted);

        let alerts = f.alerts.alerts_for("vm-1");
        let critical = alerts.iter().find(|a| a.source == AlertSource::Rollback).unwrap();
        assert_eq!(critical.severity, Severity::Critical);

        f.client.clear_faults();
        let err = f.rollback.rollback(&run_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_rollback_requires_failed_run() {
        let f = fixture();
        f.client.set_state("vm-1", json!({"cpu": 2}));
        let revision = f
            .baselines
            .capture("vm-1", config(json!({"cpu": 4})), SnapshotSource::Manual)
            .await
            .unwrap();
        let run =
            f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();

        let err = f.rollback.rollback(&run.run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_rollback_requires_latest_run() {
        let f = fixture();
        let first = failed_run(&f).await;
        let revision = f.baselines.current("vm-1").await.unwrap().revision;
        f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();

        let err = f.rollback.rollback(&first).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_residual_drift_keeps_run_failed() {
        let f = fixture();
        f.client.set_state("vm-1", json!({"cpu": 2, "tags": ["a"]}));
        let revision = f
            .baselines
            .capture("vm-1", config(json!({"cpu": 4, "tags": ["a"]})), SnapshotSource::Manual)
            .await
            .unwrap();
        f.client.drop_field_on_apply("vm-1", "tags");

        let run =
            f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
        assert_eq!(run.stage, RunStage::Failed);

        let result = f.rollback.rollback(&run.run_id).await.unwrap();
        assert!(!result.restored);
        assert_eq!(result.residual.len(), 1);
        assert_eq!(result.failure.unwrap().kind, ErrorKind::Consistency);
        assert_eq!(f.orchestrator.get_run(&run.run_id).unwrap().stage, RunStage::Failed);
    }
}
