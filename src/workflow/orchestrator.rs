//! Staged deployment pipeline: validate, back up, apply, verify.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn, Instrument};

use super::backup::BackupStore;
use super::run::{
    Applied, Approval, BackedUp, DeploymentRun, Environment, RunLedger, RunStage, Validated,
};
use super::validation::{preflight_credential, ConfigValidator};
use crate::adapter::{call_with_timeout, ResourceClient};
use crate::alerts::{notify, Alert, AlertChannel, AlertSource};
use crate::audit::{AuditEvent, AuditLog};
use crate::baseline::{BaselineStore, Snapshot, SnapshotSource};
use crate::collector::StateCollector;
use crate::config::WorkflowConfig;
use crate::drift::{DriftDetector, Severity};
use crate::errors::{EngineError, Result};
use crate::locks::ResourceLocks;
use crate::rollback::RollbackManager;
use crate::secrets::SecretsVault;

const ACTOR: &str = "orchestrator";

/// Components shared by the orchestrator and the rollback manager
#[derive(Clone)]
pub struct DeploymentContext {
    pub ledger: RunLedger,
    pub backups: BackupStore,
    pub baselines: BaselineStore,
    pub collector: StateCollector,
    pub detector: Arc<DriftDetector>,
    pub client: Arc<dyn ResourceClient>,
    pub alerts: Arc<dyn AlertChannel>,
    pub locks: ResourceLocks,
    pub audit: AuditLog,
    /// Hard limit for every adapter call made by a stage
    pub stage_timeout: Duration,
}

impl DeploymentContext {
    pub(crate) async fn alert(&self, alert: Alert) {
        notify(self.alerts.as_ref(), alert).await;
    }
}

#[derive(Clone)]
struct CredentialCheck {
    vault: Arc<SecretsVault>,
    credential_id: String,
}

pub struct WorkflowOrchestrator {
    ctx: DeploymentContext,
    validator: ConfigValidator,
    credentials: Option<CredentialCheck>,
    rollback: Arc<RollbackManager>,
    auto_rollback: bool,
    /// Runs parked at `backing_up` until approved
    awaiting_approval: DashMap<String, BackedUp>,
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("validator", &self.validator)
            .field("auto_rollback", &self.auto_rollback)
            .field("awaiting_approval", &self.awaiting_approval.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowOrchestrator {
    pub fn new(
        ctx: DeploymentContext,
        validator: ConfigValidator,
        rollback: Arc<RollbackManager>,
        auto_rollback: bool,
    ) -> Self {
        Self {
            ctx,
            validator,
            credentials: None,
            rollback,
            auto_rollback,
            awaiting_approval: DashMap::new(),
        }
    }

    pub fn from_config(
        config: &WorkflowConfig,
        ctx: DeploymentContext,
        rollback: Arc<RollbackManager>,
    ) -> Result<Self> {
        let validator = ConfigValidator::new(config.load_schema()?, config.forbidden_values.clone())?;
        Ok(Self::new(ctx, validator, rollback, config.auto_rollback))
    }

    /// Require `credential_id` to be retrievable before any run proceeds
    pub fn with_credential_check(
        mut self,
        vault: Arc<SecretsVault>,
        credential_id: impl Into<String>,
    ) -> Self {
        self.credentials = Some(CredentialCheck { vault, credential_id: credential_id.into() });
        self
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ctx.ledger
    }

    pub fn get_run(&self, run_id: &str) -> Result<DeploymentRun> {
        self.ctx.ledger.get(run_id)
    }

    pub fn runs_for_resource(&self, resource_id: &str) -> Vec<DeploymentRun> {
        self.ctx.ledger.for_resource(resource_id)
    }

    /// Create a run deploying baseline `target_revision` of `resource_id`
    /// to `environment` and drive it as far as it can go.
    ///
    /// Returns an error when no run could be created, or when the run's
    /// failure could not be written to the audit log. Otherwise a run that
    /// fails is returned in its `failed` (or `rolled_back`) state.
    /// Runs above `dev` stop at `backing_up` until [`approve`](Self::approve).
    pub async fn request_deploy(
        &self,
        resource_id: &str,
        target_revision: u64,
        environment: Environment,
        requested_by: &str,
    ) -> Result<DeploymentRun> {
        self.check_promotion(resource_id, target_revision, environment)?;

        let _guard = self.ctx.locks.acquire(resource_id).await;
        if let Some(active) = self.ctx.ledger.active_for(resource_id) {
            return Err(EngineError::conflict(
                resource_id,
                format!("run {} is still {}", active.run_id, active.stage),
            ));
        }

        let target = self.ctx.baselines.get(resource_id, target_revision).await?;
        let run = self
            .ctx
            .ledger
            .create(DeploymentRun::new(resource_id, environment, target_revision, requested_by))
            .await?;
        let span = crate::deploy_span!(run.run_id, resource_id, environment);

        self.drive(&run, target).instrument(span).await
    }

    async fn drive(&self, run: &DeploymentRun, target: Snapshot) -> Result<DeploymentRun> {
        let validated = match self.validate(run, target).await {
            Ok(validated) => validated,
            Err(e) => return self.fail(run, e).await,
        };

        if let Err(e) = self.advance(run, RunStage::BackingUp).await {
            return self.fail(run, e).await;
        }
        let backed_up = match self.back_up(validated).await {
            Ok(backed_up) => backed_up,
            Err(e) => return self.fail(run, e).await,
        };

        if run.environment.requires_approval() {
            info!("Run parked until approved");
            self.awaiting_approval.insert(run.run_id.clone(), backed_up);
            return self.ctx.ledger.get(&run.run_id);
        }

        self.apply_and_verify(backed_up).await
    }

    /// Record `approver`'s approval and resume a parked run
    pub async fn approve(&self, run_id: &str, approver: &str) -> Result<DeploymentRun> {
        let run = self.ctx.ledger.get(run_id)?;
        let _guard = self.ctx.locks.acquire(&run.resource_id).await;

        let run = self.ctx.ledger.get(run_id)?;
        if !self.awaiting_approval.contains_key(run_id) {
            return Err(EngineError::validation(format!(
                "Run {} is not awaiting approval (stage {})",
                run_id, run.stage
            )));
        }
        if approver == run.requested_by {
            return Err(EngineError::authorization(format!(
                "{} cannot approve their own run",
                approver
            )));
        }

        // Unaudited approvals are not recorded; the run stays parked
        self.ctx
            .audit
            .record(
                AuditEvent::success(approver, "run.approve", run_id)
                    .with_detail(format!("environment={}", run.environment)),
            )
            .await?;
        let run = self.ctx.ledger.update(run_id, |r| {
            r.approvals.push(Approval {
                environment: r.environment,
                approver: approver.to_string(),
                timestamp: chrono::Utc::now(),
            })
        })?;

        let Some((_, backed_up)) = self.awaiting_approval.remove(run_id) else {
            return self.ctx.ledger.get(run_id);
        };
        let span = crate::deploy_span!(run.run_id, run.resource_id, run.environment);
        self.apply_and_verify(backed_up).instrument(span).await
    }

    /// Cancel a run that has not touched live infrastructure yet
    pub async fn cancel(&self, run_id: &str, actor: &str) -> Result<DeploymentRun> {
        let run = self.ctx.ledger.get(run_id)?;
        let _guard = self.ctx.locks.acquire(&run.resource_id).await;

        let cancelled = self.ctx.ledger.transition(run_id, RunStage::Cancelled, actor).await?;
        self.awaiting_approval.remove(run_id);
        Ok(cancelled)
    }

    fn check_promotion(
        &self,
        resource_id: &str,
        target_revision: u64,
        environment: Environment,
    ) -> Result<()> {
        let Some(previous) = environment.predecessor() else {
            return Ok(());
        };

        let promoted = self.ctx.ledger.for_resource(resource_id).iter().any(|r| {
            r.environment == previous
                && r.target_revision == target_revision
                && r.stage == RunStage::Succeeded
        });
        if promoted {
            Ok(())
        } else {
            Err(EngineError::validation(format!(
                "Revision {} of {} has not succeeded in {}",
                target_revision, resource_id, previous
            )))
        }
    }

    async fn validate(&self, run: &DeploymentRun, target: Snapshot) -> Result<Validated> {
        self.validator.validate(&target.config, run.environment)?;
        if let Some(check) = &self.credentials {
            preflight_credential(&check.vault, &check.credential_id).await?;
        }
        Ok(Validated::new(&run.run_id, target))
    }

    async fn back_up(&self, validated: Validated) -> Result<BackedUp> {
        let resource_id = validated.target().resource_id.clone();
        let live = self.ctx.collector.collect_once(&resource_id, self.ctx.stage_timeout).await?;
        let backup_ref = self.ctx.backups.put(&resource_id, validated.run_id(), live.config);

        self.ctx.ledger.update(validated.run_id(), |r| r.backup_ref = Some(backup_ref.clone()))?;
        info!(backup_ref = %backup_ref, "Backup captured");
        Ok(BackedUp::new(validated, backup_ref))
    }

    async fn apply(&self, backed_up: BackedUp) -> Result<Applied> {
        let target = backed_up.target();
        call_with_timeout(
            self.ctx.stage_timeout,
            self.ctx.client.apply_state(&target.resource_id, &target.config),
        )
        .await
        .map_err(|e| e.into_engine_error(&target.resource_id))?;
        Ok(Applied::new(backed_up))
    }

    async fn verify(&self, applied: &Applied) -> Result<()> {
        let target = applied.target();
        let residual = self
            .ctx
            .detector
            .verify(&target.resource_id, &target.config, self.ctx.stage_timeout)
            .await?;
        if residual.is_empty() {
            Ok(())
        } else {
            Err(EngineError::consistency(&target.resource_id, residual.len()))
        }
    }

    async fn advance(&self, run: &DeploymentRun, next: RunStage) -> Result<DeploymentRun> {
        self.ctx.ledger.transition(&run.run_id, next, ACTOR).await
    }

    /// Caller holds the resource lock
    async fn apply_and_verify(&self, backed_up: BackedUp) -> Result<DeploymentRun> {
        let run = self.ctx.ledger.get(backed_up.run_id())?;
        if run.environment.requires_approval() && !run.is_approved() {
            let error = EngineError::authorization(format!(
                "Run {} has no approval for {}",
                run.run_id, run.environment
            ));
            return self.fail(&run, error).await;
        }
        if let Err(e) = self.advance(&run, RunStage::Applying).await {
            return self.fail(&run, e).await;
        }

        let applied = match self.apply(backed_up).await {
            Ok(applied) => applied,
            Err(e) => return self.fail(&run, e).await,
        };

        if let Err(e) = self.advance(&run, RunStage::Verifying).await {
            return self.fail(&run, e).await;
        }
        if let Err(e) = self.verify(&applied).await {
            return self.fail(&run, e).await;
        }

        let succeeded = match self.advance(&run, RunStage::Succeeded).await {
            Ok(succeeded) => succeeded,
            Err(e) => return self.fail(&run, e).await,
        };
        self.record_deployed_baseline(&applied).await?;
        info!(run_id = %run.run_id, "Deployment succeeded");
        Ok(succeeded)
    }

    /// Keep the current baseline equal to what was just deployed
    async fn record_deployed_baseline(&self, applied: &Applied) -> Result<()> {
        let target = applied.target();
        let current = self.ctx.baselines.latest(&target.resource_id).await?;
        if current.as_ref().map(|c| &c.config) == Some(&target.config) {
            return Ok(());
        }
        let revision = self
            .ctx
            .baselines
            .capture(&target.resource_id, target.config.clone(), SnapshotSource::Deploy)
            .await?;
        info!(revision, "Recorded deployed configuration as current baseline");
        Ok(())
    }

    /// Mark the run failed. Failures after live mutation started are
    /// alerted and, when enabled, rolled back. Caller holds the resource lock.
    ///
    /// A failure that reached the ledger but not the audit log still gets
    /// its alert and rollback; the audit error is returned afterwards.
    async fn fail(&self, run: &DeploymentRun, error: EngineError) -> Result<DeploymentRun> {
        let recorded = self.ctx.ledger.fail(&run.run_id, &error, ACTOR).await;
        let failed = self.ctx.ledger.get(&run.run_id)?;
        if failed.stage != RunStage::Failed {
            return recorded;
        }
        let mutated = failed.failure.as_ref().is_some_and(|f| {
            matches!(f.stage, RunStage::Applying | RunStage::Verifying)
        });
        warn!(run_id = %run.run_id, error = %error, mutated, "Deployment run failed");

        if !mutated {
            return recorded;
        }

        self.ctx
            .alert(
                Alert::new(
                    AlertSource::DeploymentRun,
                    Severity::High,
                    &run.resource_id,
                    &run.run_id,
                    format!(
                        "Deployment of {} revision {} to {} failed",
                        run.resource_id, run.target_revision, run.environment
                    ),
                )
                .with_error(&error),
            )
            .await;

        if self.auto_rollback {
            match self.rollback.rollback_locked(&run.run_id).await {
                Ok(result) => info!(restored = result.restored, "Automatic rollback finished"),
                Err(e) => warn!(error = %e, "Automatic rollback could not run"),
            }
        }
        recorded?;
        self.ctx.ledger.get(&run.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, ConfigMap, InMemoryResourceClient};
    use crate::alerts::RecordingAlertChannel;
    use crate::collector::RetryPolicy;
    use crate::config::DriftConfig;
    use crate::drift::DriftReportStore;
    use crate::errors::ErrorKind;
    use serde_json::json;

    struct Fixture {
        client: Arc<InMemoryResourceClient>,
        baselines: BaselineStore,
        alerts: RecordingAlertChannel,
        orchestrator: WorkflowOrchestrator,
    }

    fn fixture(auto_rollback: bool) -> Fixture {
        fixture_with_audit(auto_rollback, AuditLog::in_memory())
    }

    fn fixture_with_audit(auto_rollback: bool, audit: AuditLog) -> Fixture {
        let client = Arc::new(InMemoryResourceClient::new());
        let baselines = BaselineStore::in_memory();
        let locks = ResourceLocks::new();
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
            WorkflowOrchestrator::new(ctx, ConfigValidator::default(), rollback, auto_rollback);
        Fixture { client, baselines, alerts, orchestrator }
    }

    fn config(value: serde_json::Value) -> ConfigMap {
        value.as_object().cloned().unwrap()
    }

    async fn seed(f: &Fixture, live: serde_json::Value, target: serde_json::Value) -> u64 {
        f.client.set_state("vm-1", live);
        f.baselines.capture("vm-1", config(target), SnapshotSource::Manual).await.unwrap()
    }

    #[tokio::test]
    async fn test_dev_deploy_succeeds() {
        let f = fixture(false);
        let revision = seed(&f, json!({"cpu": 2}), json!({"cpu": 4})).await;

        let run =
            f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
        assert_eq!(run.stage, RunStage::Succeeded);
        assert!(run.backup_ref.is_some());
        assert_eq!(f.client.state("vm-1"), Some(config(json!({"cpu": 4}))));
        // Target was already the current baseline, so nothing new is captured
        assert_eq!(f.baselines.current("vm-1").await.unwrap().revision, revision);
    }

    #[tokio::test]
    async fn test_staging_parks_until_approved() {
        let f = fixture(false);
        let revision = seed(&f, json!({"cpu": 2}), json!({"cpu": 4})).await;
        f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();

        let run = f
            .orchestrator
            .request_deploy("vm-1", revision, Environment::Staging, "alice")
            .await
            .unwrap();
        assert_eq!(run.stage, RunStage::BackingUp);
        assert!(run.approvals.is_empty());
        assert_eq!(f.client.apply_calls("vm-1"), 1);

        let err = f.orchestrator.approve(&run.run_id, "alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let run = f.orchestrator.approve(&run.run_id, "bob").await.unwrap();
        assert_eq!(run.stage, RunStage::Succeeded);
        assert_eq!(run.approvals.len(), 1);
        assert_eq!(run.approvals[0].environment, Environment::Staging);
    }

    #[tokio::test]
    async fn test_promotion_requires_predecessor_success() {
        let f = fixture(false);
        let revision = seed(&f, json!({"cpu": 2}), json!({"cpu": 4})).await;

        let err = f
            .orchestrator
            .request_deploy("vm-1", revision, Environment::Prod, "alice")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(f.orchestrator.runs_for_resource("vm-1").is_empty());
    }

    #[tokio::test]
    async fn test_active_run_blocks_new_runs() {
        let f = fixture(false);
        let revision = seed(&f, json!({"cpu": 2}), json!({"cpu": 4})).await;
        f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
        f.orchestrator
            .request_deploy("vm-1", revision, Environment::Staging, "alice")
            .await
            .unwrap();

        let err = f
            .orchestrator
            .request_deploy("vm-1", revision, Environment::Dev, "alice")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_cancel_parked_run() {
        let f = fixture(false);
        let revision = seed(&f, json!({"cpu": 2}), json!({"cpu": 4})).await;
        f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
        let run = f
            .orchestrator
            .request_deploy("vm-1", revision, Environment::Staging, "alice")
            .await
            .unwrap();

        let cancelled = f.orchestrator.cancel(&run.run_id, "alice").await.unwrap();
        assert_eq!(cancelled.stage, RunStage::Cancelled);
        assert!(f.orchestrator.approve(&run.run_id, "bob").await.is_err());

        // Finished runs cannot be cancelled
        let dev_run = &f.orchestrator.runs_for_resource("vm-1")[0];
        let err = f.orchestrator.cancel(&dev_run.run_id, "alice").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_validation_failure_never_touches_live_state() {
        let mut f = fixture(false);
        f.orchestrator.validator = ConfigValidator::new(
            None,
            vec![crate::workflow::ForbiddenValueRule {
                path: "public".to_string(),
                values: vec![json!(true)],
                environments: None,
            }],
        )
        .unwrap();
        let revision = seed(&f, json!({"cpu": 2}), json!({"cpu": 4, "public": true})).await;

        let run =
            f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
        assert_eq!(run.stage, RunStage::Failed);
        assert_eq!(run.failure.as_ref().unwrap().kind, ErrorKind::Validation);
        assert!(run.backup_ref.is_none());
        assert_eq!(f.client.apply_calls("vm-1"), 0);
        assert!(f.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_backup_failure_aborts_run() {
        let f = fixture(true);
        let revision = seed(&f, json!({"cpu": 2}), json!({"cpu": 4})).await;
        f.client.fail_next_gets("vm-1", 1, AdapterError::unavailable("503"));

        let run =
            f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
        assert_eq!(run.stage, RunStage::Failed);
        assert_eq!(run.failure.as_ref().unwrap().stage, RunStage::BackingUp);
        assert_eq!(f.client.apply_calls("vm-1"), 0);
        assert!(!run.rollback_attempted);
    }

    #[tokio::test]
    async fn test_verify_failure_is_alerted_and_rolled_back() {
        let f = fixture(true);
        let revision =
            seed(&f, json!({"cpu": 2}), json!({"cpu": 4, "tags": ["web"]})).await;
        f.client.drop_field_on_apply("vm-1", "tags");

        let run =
            f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
        assert_eq!(run.stage, RunStage::RolledBack);
        assert_eq!(run.failure.as_ref().unwrap().kind, ErrorKind::Consistency);
        assert_eq!(f.client.state("vm-1"), Some(config(json!({"cpu": 2}))));

        let alerts = f.alerts.alerts_for("vm-1");
        assert_eq!(alerts[0].source, AlertSource::DeploymentRun);
        assert_eq!(alerts[0].error_kind, Some(ErrorKind::Consistency));
    }

    #[tokio::test]
    async fn test_apply_failure_without_auto_rollback_stays_failed() {
        let f = fixture(false);
        let revision = seed(&f, json!({"cpu": 2}), json!({"cpu": 4})).await;
        f.client.fail_applies("vm-1", AdapterError::conflict("etag mismatch"));

        let run =
            f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
        assert_eq!(run.stage, RunStage::Failed);
        assert_eq!(run.failure.as_ref().unwrap().kind, ErrorKind::Conflict);
        assert_eq!(f.alerts.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_deploying_older_revision_records_new_baseline() {
        let f = fixture(false);
        let first = seed(&f, json!({"cpu": 2}), json!({"cpu": 2})).await;
        f.baselines.capture("vm-1", config(json!({"cpu": 8})), SnapshotSource::Manual).await.unwrap();

        let run =
            f.orchestrator.request_deploy("vm-1", first, Environment::Dev, "alice").await.unwrap();
        assert_eq!(run.stage, RunStage::Succeeded);

        let current = f.baselines.current("vm-1").await.unwrap();
        assert_eq!(current.revision, 3);
        assert_eq!(current.source, SnapshotSource::Deploy);
        assert_eq!(current.config, config(json!({"cpu": 2})));
    }

    #[tokio::test]
    async fn test_unknown_revision_creates_no_run() {
        let f = fixture(false);
        seed(&f, json!({"cpu": 2}), json!({"cpu": 4})).await;

        let err =
            f.orchestrator.request_deploy("vm-1", 9, Environment::Dev, "alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(f.orchestrator.runs_for_resource("vm-1").is_empty());
    }

    #[tokio::test]
    async fn test_unapproved_run_never_reaches_apply() {
        let f = fixture(true);
        let revision = seed(&f, json!({"cpu": 2}), json!({"cpu": 4})).await;
        let ledger = f.orchestrator.ledger();
        let run = ledger
            .create(DeploymentRun::new("vm-1", Environment::Staging, revision, "alice"))
            .await
            .unwrap();
        ledger.transition(&run.run_id, RunStage::BackingUp, ACTOR).await.unwrap();

        let target = f.baselines.get("vm-1", revision).await.unwrap();
        let backed_up =
            BackedUp::new(Validated::new(&run.run_id, target), "backup-unapproved".to_string());
        let _guard = f.orchestrator.ctx.locks.acquire("vm-1").await;
        let run = f.orchestrator.apply_and_verify(backed_up).await.unwrap();

        assert_eq!(run.stage, RunStage::Failed);
        let failure = run.failure.as_ref().unwrap();
        assert_eq!(failure.kind, ErrorKind::Authorization);
        assert_eq!(failure.stage, RunStage::BackingUp);
        assert_eq!(f.client.apply_calls("vm-1"), 0);
        assert_eq!(f.client.state("vm-1"), Some(config(json!({"cpu": 2}))));
    }

    #[tokio::test]
    async fn test_unaudited_approval_leaves_run_parked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let audit =
            AuditLog::open(Arc::new(crate::audit::JsonlAuditSink::new(&path))).await.unwrap();
        let f = fixture_with_audit(false, audit);
        let revision = seed(&f, json!({"cpu": 2}), json!({"cpu": 4})).await;
        f.orchestrator.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
        let run = f
            .orchestrator
            .request_deploy("vm-1", revision, Environment::Staging, "alice")
            .await
            .unwrap();

        let contents = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        assert!(f.orchestrator.approve(&run.run_id, "bob").await.is_err());

        let parked = f.orchestrator.get_run(&run.run_id).unwrap();
        assert_eq!(parked.stage, RunStage::BackingUp);
        assert!(parked.approvals.is_empty());
        assert_eq!(f.client.apply_calls("vm-1"), 1);

        std::fs::remove_dir(&path).unwrap();
        std::fs::write(&path, contents).unwrap();
        let run = f.orchestrator.approve(&run.run_id, "bob").await.unwrap();
        assert_eq!(run.stage, RunStage::Succeeded);
    }
}
