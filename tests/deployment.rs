//! Deployment pipeline, promotion gates and rollback through the engine.

mod common;

use common::{config, engine, engine_with, ids, test_config, CREDENTIAL_ID};
use driftwatch::adapter::AdapterError;
use driftwatch::baseline::SnapshotSource;
use driftwatch::workflow::{Environment, ForbiddenValueRule, RunStage};
use driftwatch::ErrorKind;
use serde_json::json;

async fn propose(t: &common::TestEngine, desired: serde_json::Value) -> u64 {
    t.engine.baselines().capture("vm-1", config(desired), SnapshotSource::Manual).await.unwrap()
}

#[tokio::test]
async fn staging_run_without_approval_never_applies() {
    let t = engine().await;
    t.client.set_state("vm-1", json!({"cpu": 2}));
    let revision = propose(&t, json!({"cpu": 4})).await;

    let dev = t.engine.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
    assert_eq!(dev.stage, RunStage::Succeeded);
    let applies_after_dev = t.client.apply_calls("vm-1");

    let staging =
        t.engine.request_deploy("vm-1", revision, Environment::Staging, "alice").await.unwrap();
    assert!(staging.approvals.is_empty());
    assert_eq!(staging.stage, RunStage::BackingUp);
    assert_eq!(t.client.apply_calls("vm-1"), applies_after_dev);

    // Still parked when looked up later
    let parked = t.engine.orchestrator().get_run(&staging.run_id).unwrap();
    assert_eq!(parked.stage, RunStage::BackingUp);
}

#[tokio::test]
async fn promotion_through_every_environment() {
    let t = engine().await;
    t.client.set_state("vm-1", json!({"cpu": 2}));
    let revision = propose(&t, json!({"cpu": 4})).await;

    let prod_early = t.engine.request_deploy("vm-1", revision, Environment::Prod, "alice").await;
    assert_eq!(prod_early.unwrap_err().kind(), ErrorKind::Validation);

    t.engine.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
    let staging =
        t.engine.request_deploy("vm-1", revision, Environment::Staging, "alice").await.unwrap();
    let staging = t.engine.approve(&staging.run_id, "bob").await.unwrap();
    assert_eq!(staging.stage, RunStage::Succeeded);

    let prod = t.engine.request_deploy("vm-1", revision, Environment::Prod, "alice").await.unwrap();
    let prod = t.engine.approve(&prod.run_id, "carol").await.unwrap();
    assert_eq!(prod.stage, RunStage::Succeeded);
    assert_eq!(prod.approvals[0].approver, "carol");

    let stages: Vec<RunStage> =
        t.engine.orchestrator().runs_for_resource("vm-1").iter().map(|r| r.stage).collect();
    assert_eq!(stages, vec![RunStage::Succeeded; 3]);

    let outcome = t.engine.request_scan(&ids(&["vm-1"])).await;
    assert_eq!(outcome.summary.clean, ids(&["vm-1"]));
}

#[tokio::test]
async fn failed_apply_rolls_back_to_backup_with_zero_drift() {
    let mut cfg = test_config();
    cfg.workflow.auto_rollback = false;
    let t = engine_with(cfg).await;

    t.client.set_state("vm-1", json!({"cpu": 2, "memory_mb": 1024}));
    t.engine.adopt("vm-1", "alice").await.unwrap();
    let revision = propose(&t, json!({"cpu": 4, "memory_mb": 4096})).await;

    // The write lands but the provider reports a failure
    t.client.fail_after_apply("vm-1");
    let run = t.engine.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
    assert_eq!(run.stage, RunStage::Failed);
    assert_eq!(run.failure.as_ref().unwrap().stage, RunStage::Applying);
    assert_eq!(t.client.state("vm-1"), Some(config(json!({"cpu": 4, "memory_mb": 4096}))));

    let result = t.engine.rollback(&run.run_id).await.unwrap();
    assert!(result.restored);
    assert_eq!(t.client.state("vm-1"), Some(config(json!({"cpu": 2, "memory_mb": 1024}))));
    assert_eq!(t.engine.orchestrator().get_run(&run.run_id).unwrap().stage, RunStage::RolledBack);

    // Post-rollback verification against the backup shows no drift
    let backup = t.engine.adopt("vm-1", "alice").await.unwrap();
    let snapshot = t.engine.baselines().get("vm-1", backup).await.unwrap();
    assert_eq!(snapshot.config, config(json!({"cpu": 2, "memory_mb": 1024})));
    let outcome = t.engine.request_scan(&ids(&["vm-1"])).await;
    assert!(outcome.summary.reports.is_empty());
}

#[tokio::test]
async fn automatic_rollback_after_verification_failure() {
    let t = engine().await;
    t.client.set_state("vm-1", json!({"cpu": 2, "tags": ["web"]}));
    let revision = propose(&t, json!({"cpu": 4, "tags": ["web", "db"]})).await;
    t.client.drop_field_on_apply("vm-1", "tags");

    let run = t.engine.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
    assert_eq!(run.stage, RunStage::Failed);
    assert!(run.rollback_attempted);
    assert_eq!(run.failure.as_ref().unwrap().kind, ErrorKind::Consistency);

    // The dropped field also breaks the rollback verification
    let alerts = t.alerts.alerts_for("vm-1");
    assert!(alerts.iter().any(|a| a.severity == driftwatch::drift::Severity::Critical));
    assert!(t.engine.rollback(&run.run_id).await.is_err());
}

#[tokio::test]
async fn forbidden_value_fails_validation_without_mutation() {
    let mut cfg = test_config();
    cfg.workflow.forbidden_values = vec![ForbiddenValueRule {
        path: "network.public_ip".to_string(),
        values: vec![json!(true)],
        environments: None,
    }];
    let t = engine_with(cfg).await;
    t.client.set_state("vm-1", json!({"network": {"public_ip": false}}));
    let revision = propose(&t, json!({"network": {"public_ip": true}})).await;

    let run = t.engine.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
    assert_eq!(run.stage, RunStage::Failed);
    assert_eq!(run.failure.unwrap().kind, ErrorKind::Validation);
    assert_eq!(t.client.apply_calls("vm-1"), 0);
    assert_eq!(t.client.get_calls("vm-1"), 0);
}

#[tokio::test]
async fn revoked_credential_blocks_deployment() {
    let t = engine().await;
    t.client.set_state("vm-1", json!({"cpu": 2}));
    let revision = propose(&t, json!({"cpu": 4})).await;
    t.engine.vault().revoke(CREDENTIAL_ID).await.unwrap();

    let run = t.engine.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
    assert_eq!(run.stage, RunStage::Failed);
    assert_eq!(run.failure.unwrap().kind, ErrorKind::Authorization);
    assert_eq!(t.client.apply_calls("vm-1"), 0);
}

#[tokio::test]
async fn deploys_and_scans_of_one_resource_do_not_interleave() {
    let t = engine().await;
    t.client.set_state("vm-1", json!({"cpu": 2}));
    let revision = propose(&t, json!({"cpu": 4})).await;

    let engine = t.engine.clone();
    let deploy = tokio::spawn(async move {
        engine.request_deploy("vm-1", revision, Environment::Dev, "alice").await
    });
    let outcome = t.engine.request_scan(&ids(&["vm-1"])).await;
    let run = deploy.await.unwrap().unwrap();
    assert_eq!(run.stage, RunStage::Succeeded);

    // The scan saw either the old state (drift) or the new one (clean),
    // never a failure from a half-applied resource
    assert!(outcome.summary.failures.is_empty());
}

#[tokio::test]
async fn timed_out_backup_is_a_hard_failure() {
    let t = engine().await;
    t.client.set_state("vm-1", json!({"cpu": 2}));
    let revision = propose(&t, json!({"cpu": 4})).await;
    t.client.fail_next_gets("vm-1", 1, AdapterError::Timeout { timeout_ms: 500 });

    let run = t.engine.request_deploy("vm-1", revision, Environment::Dev, "alice").await.unwrap();
    assert_eq!(run.stage, RunStage::Failed);
    assert_eq!(run.failure.unwrap().stage, RunStage::BackingUp);
    assert_eq!(t.client.apply_calls("vm-1"), 0);
}
