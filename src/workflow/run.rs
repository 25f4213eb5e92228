//! Deployment run model and its state machine.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::{AuditEvent, AuditLog};
use crate::baseline::Snapshot;
use crate::errors::{EngineError, ErrorKind, Result};
use crate::observability::MetricsRecorder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }

    /// Environments above dev need a recorded approval before applying
    pub fn requires_approval(&self) -> bool {
        !matches!(self, Environment::Dev)
    }

    /// The environment that must have succeeded first
    pub fn predecessor(&self) -> Option<Environment> {
        match self {
            Environment::Dev => None,
            Environment::Staging => Some(Environment::Dev),
            Environment::Prod => Some(Environment::Staging),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(EngineError::validation(format!("Unknown environment '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Validating,
    BackingUp,
    Applying,
    Verifying,
    Succeeded,
    Failed,
    RolledBack,
    Cancelled,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Validating => "validating",
            RunStage::BackingUp => "backing_up",
            RunStage::Applying => "applying",
            RunStage::Verifying => "verifying",
            RunStage::Succeeded => "succeeded",
            RunStage::Failed => "failed",
            RunStage::RolledBack => "rolled_back",
            RunStage::Cancelled => "cancelled",
        }
    }

    /// No further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Succeeded | RunStage::RolledBack | RunStage::Cancelled)
    }

    /// The run is still in the pipeline and blocks new runs for its resource
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStage::Validating | RunStage::BackingUp | RunStage::Applying | RunStage::Verifying
        )
    }

    /// Live infrastructure has not been touched yet
    pub fn is_cancellable(&self) -> bool {
        matches!(self, RunStage::Validating | RunStage::BackingUp)
    }

    pub fn can_transition_to(&self, next: RunStage) -> bool {
        use RunStage::*;
        matches!(
            (self, next),
            (Validating, BackingUp)
                | (Validating, Failed)
                | (Validating, Cancelled)
                | (BackingUp, Applying)
                | (BackingUp, Failed)
                | (BackingUp, Cancelled)
                | (Applying, Verifying)
                | (Applying, Failed)
                | (Verifying, Succeeded)
                | (Verifying, Failed)
                | (Failed, RolledBack)
        )
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub environment: Environment,
    pub approver: String,
    pub timestamp: DateTime<Utc>,
}

/// Why a run failed, as reported to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: RunStage,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRun {
    pub run_id: String,
    pub resource_id: String,
    pub environment: Environment,
    pub target_revision: u64,
    pub stage: RunStage,
    pub backup_ref: Option<String>,
    pub approvals: Vec<Approval>,
    pub failure: Option<RunFailure>,
    pub rollback_attempted: bool,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    sequence: u64,
}

impl DeploymentRun {
    pub(crate) fn new(
        resource_id: &str,
        environment: Environment,
        target_revision: u64,
        requested_by: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: format!("run-{}", uuid::Uuid::new_v4()),
            resource_id: resource_id.to_string(),
            environment,
            target_revision,
            stage: RunStage::Validating,
            backup_ref: None,
            approvals: Vec::new(),
            failure: None,
            rollback_attempted: false,
            requested_by: requested_by.to_string(),
            created_at: now,
            updated_at: now,
            sequence: 0,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.approvals.iter().any(|a| a.environment == self.environment)
    }
}

/// Proof that the target configuration passed validation
#[derive(Debug)]
pub struct Validated {
    run_id: String,
    target: Snapshot,
}

impl Validated {
    pub(super) fn new(run_id: &str, target: Snapshot) -> Self {
        Self { run_id: run_id.to_string(), target }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn target(&self) -> &Snapshot {
        &self.target
    }
}

/// Proof that a backup exists; the only way to reach the apply stage
#[derive(Debug)]
pub struct BackedUp {
    validated: Validated,
    backup_ref: String,
}

impl BackedUp {
    pub(super) fn new(validated: Validated, backup_ref: String) -> Self {
        Self { validated, backup_ref }
    }

    pub fn run_id(&self) -> &str {
        self.validated.run_id()
    }

    pub fn target(&self) -> &Snapshot {
        self.validated.target()
    }

    pub fn backup_ref(&self) -> &str {
        &self.backup_ref
    }
}

/// Proof that the target was applied; the only way to reach verification
#[derive(Debug)]
pub struct Applied {
    backed_up: BackedUp,
}

impl Applied {
    pub(super) fn new(backed_up: BackedUp) -> Self {
        Self { backed_up }
    }

    pub fn run_id(&self) -> &str {
        self.backed_up.run_id()
    }

    pub fn target(&self) -> &Snapshot {
        self.backed_up.target()
    }
}

/// Authoritative run state, shared by the orchestrator and the rollback
/// manager. Every stage change goes through [`RunLedger::transition`] and
/// is audited.
#[derive(Clone)]
pub struct RunLedger {
    runs: Arc<DashMap<String, DeploymentRun>>,
    next_sequence: Arc<AtomicU64>,
    audit: AuditLog,
    metrics: MetricsRecorder,
}

impl fmt::Debug for RunLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLedger").field("runs", &self.runs.len()).finish()
    }
}

impl RunLedger {
    pub fn new(audit: AuditLog) -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
            next_sequence: Arc::new(AtomicU64::new(1)),
            audit,
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn get(&self, run_id: &str) -> Result<DeploymentRun> {
        self.runs
            .get(run_id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::not_found("deployment_run", run_id))
    }

    /// Runs for one resource in creation order
    pub fn for_resource(&self, resource_id: &str) -> Vec<DeploymentRun> {
        let mut runs: Vec<DeploymentRun> = self
            .runs
            .iter()
            .filter(|r| r.resource_id == resource_id)
            .map(|r| r.clone())
            .collect();
        runs.sort_by_key(|r| r.sequence);
        runs
    }

    pub fn latest_for(&self, resource_id: &str) -> Option<DeploymentRun> {
        self.for_resource(resource_id).pop()
    }

    pub fn active_for(&self, resource_id: &str) -> Option<DeploymentRun> {
        self.for_resource(resource_id).into_iter().find(|r| r.stage.is_active())
    }

    /// Register a run at `validating`. The run only exists once its creation
    /// is in the audit log.
    pub(crate) async fn create(&self, mut run: DeploymentRun) -> Result<DeploymentRun> {
        self.audit
            .record(
                AuditEvent::success(&run.requested_by, "run.stage.validating", &run.run_id)
                    .with_detail(format!(
                        "resource={} environment={} target_revision={}",
                        run.resource_id, run.environment, run.target_revision
                    )),
            )
            .await?;

        run.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.runs.insert(run.run_id.clone(), run.clone());
        self.metrics.record_stage_transition(run.environment.as_str(), run.stage.as_str());
        Ok(run)
    }

    /// Apply a non-stage mutation (approvals, backup ref, flags)
    pub(crate) fn update(
        &self,
        run_id: &str,
        mutate: impl FnOnce(&mut DeploymentRun),
    ) -> Result<DeploymentRun> {
        let mut entry = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| EngineError::not_found("deployment_run", run_id))?;
        mutate(&mut entry);
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Move a run to `next`, rejecting transitions the state machine forbids.
    /// The stage only changes after the transition is in the audit log.
    pub(crate) async fn transition(
        &self,
        run_id: &str,
        next: RunStage,
        actor: &str,
    ) -> Result<DeploymentRun> {
        let from = self.get(run_id)?.stage;
        if !from.can_transition_to(next) {
            return Err(EngineError::invalid_transition(run_id, from, next));
        }
        self.audit
            .record(
                AuditEvent::success(actor, format!("run.stage.{}", next), run_id)
                    .with_detail(format!("{} -> {}", from, next)),
            )
            .await?;

        let (from, run) = self.apply_transition(run_id, next, None)?;
        self.after_transition(&run, from);
        Ok(run)
    }

    /// Move a run to `failed`, recording the error kind for operators and
    /// the full error for the audit log.
    ///
    /// The stage change is committed even when the audit append fails; the
    /// append error is returned in that case.
    pub(crate) async fn fail(
        &self,
        run_id: &str,
        error: &EngineError,
        actor: &str,
    ) -> Result<DeploymentRun> {
        let (from, run) = self.apply_transition(run_id, RunStage::Failed, Some(error))?;
        self.after_transition(&run, from);
        self.audit
            .record(AuditEvent::failure(
                actor,
                "run.stage.failed",
                run_id,
                format!("{} -> failed: {}", from, error),
            ))
            .await?;
        Ok(run)
    }

    fn apply_transition(
        &self,
        run_id: &str,
        next: RunStage,
        error: Option<&EngineError>,
    ) -> Result<(RunStage, DeploymentRun)> {
        let mut entry = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| EngineError::not_found("deployment_run", run_id))?;

        let from = entry.stage;
        if !from.can_transition_to(next) {
            return Err(EngineError::invalid_transition(run_id, from, next));
        }

        entry.stage = next;
        entry.updated_at = Utc::now();
        if let Some(error) = error {
            entry.failure = Some(RunFailure {
                stage: from,
                kind: error.kind(),
                message: error.to_string(),
            });
        }
        Ok((from, entry.clone()))
    }

    fn after_transition(&self, run: &DeploymentRun, from: RunStage) {
        self.metrics.record_stage_transition(run.environment.as_str(), run.stage.as_str());
        info!(
            run_id = %run.run_id,
            resource_id = %run.resource_id,
            environment = %run.environment,
            from = %from,
            to = %run.stage,
            "Deployment run transitioned"
        );
    }
}
