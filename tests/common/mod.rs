//! Common test utilities for all integration tests.
//!
//! Provides an engine wired to an in-memory provider, an in-memory vault and
//! a recording alert channel, plus a throwaway SQLite database.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

pub mod test_db;

use std::sync::Arc;

use driftwatch::adapter::{ConfigMap, InMemoryResourceClient};
use driftwatch::alerts::RecordingAlertChannel;
use driftwatch::audit::AuditLog;
use driftwatch::baseline::BaselineStore;
use driftwatch::config::AppConfig;
use driftwatch::secrets::{CredentialCipher, SecretString, SecretsVault, MIN_PBKDF2_ITERATIONS};
use driftwatch::Engine;

pub const CREDENTIAL_ID: &str = "provider-api-token";

pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub client: Arc<InMemoryResourceClient>,
    pub alerts: RecordingAlertChannel,
    pub audit: AuditLog,
}

/// Defaults tuned for tests: no backoff, short timeouts
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.collector.max_attempts = 2;
    config.collector.base_backoff_ms = 1;
    config.collector.max_backoff_ms = 2;
    config.collector.call_timeout_ms = 500;
    config.workflow.stage_timeout_ms = 500;
    config.provider.credential_id = CREDENTIAL_ID.to_string();
    config
}

pub fn test_cipher() -> CredentialCipher {
    CredentialCipher::new(SecretString::new("integration-master-secret"), MIN_PBKDF2_ITERATIONS)
        .expect("cipher")
}

pub fn test_vault(audit: AuditLog) -> SecretsVault {
    SecretsVault::new(test_cipher(), audit, chrono::Duration::days(90))
}

pub async fn engine_with(config: AppConfig) -> TestEngine {
    let audit = AuditLog::in_memory();
    let vault = test_vault(audit.clone());
    vault.store(CREDENTIAL_ID, "tok-integration").await.expect("store credential");

    let client = Arc::new(InMemoryResourceClient::new());
    let alerts = RecordingAlertChannel::new();
    let engine = Engine::from_config(
        &config,
        client.clone(),
        BaselineStore::in_memory(),
        Arc::new(vault),
        audit.clone(),
        Arc::new(alerts.clone()),
    )
    .expect("engine");

    TestEngine { engine: Arc::new(engine), client, alerts, audit }
}

pub async fn engine() -> TestEngine {
    engine_with(test_config()).await
}

pub fn config(value: serde_json::Value) -> ConfigMap {
    value.as_object().cloned().expect("object")
}

pub fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}
