//! # Workflow Orchestrator
//!
//! Drives a deployment run through `validating → backing_up → applying →
//! verifying`. Each stage hands the next one a witness value that only it
//! can construct, so no code path reaches `apply` without a backup or
//! `verify` without an apply. The persisted stage field is additionally
//! guarded by [`RunStage::can_transition_to`].
//!
//! Environments are promoted in order (`dev → staging → prod`): a run for
//! staging or prod can only be created once the same revision succeeded in
//! the previous environment, and it parks at `backing_up` until approved.

pub mod backup;
pub mod orchestrator;
pub mod run;
pub mod validation;

pub use backup::{Backup, BackupStore};
pub use orchestrator::{DeploymentContext, WorkflowOrchestrator};
pub use run::{
    Applied, Approval, BackedUp, DeploymentRun, Environment, RunFailure, RunLedger, RunStage,
    Validated,
};
pub use validation::{preflight_credential, ConfigValidator, ForbiddenValueRule, ValidationIssue};
