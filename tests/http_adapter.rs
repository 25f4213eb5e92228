//! HTTP provider adapter and webhook alert channel against a mock server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, test_vault, CREDENTIAL_ID};
use driftwatch::adapter::{AdapterError, HttpResourceClient, ResourceClient};
use driftwatch::alerts::{Alert, AlertChannel, AlertSource, WebhookAlertChannel};
use driftwatch::audit::AuditLog;
use driftwatch::drift::Severity;
use driftwatch::secrets::SecretsVault;
use driftwatch::ErrorKind;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn vault_with_token(token: &str) -> Arc<SecretsVault> {
    let vault = test_vault(AuditLog::in_memory());
    vault.store(CREDENTIAL_ID, token).await.unwrap();
    Arc::new(vault)
}

#[tokio::test]
async fn get_state_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resources/vm-1/state"))
        .and(header("authorization", "Bearer tok-http"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cpu": 2, "tags": ["a"]})))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpResourceClient::new(server.uri(), CREDENTIAL_ID, vault_with_token("tok-http").await);
    let state = client.get_state("vm-1").await.unwrap();
    assert_eq!(state, config(json!({"cpu": 2, "tags": ["a"]})));
}

#[tokio::test]
async fn apply_state_puts_the_config() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/resources/vm-1/state"))
        .and(body_json(json!({"cpu": 4})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpResourceClient::new(server.uri(), CREDENTIAL_ID, vault_with_token("tok-http").await);
    client.apply_state("vm-1", &config(json!({"cpu": 4}))).await.unwrap();
}

#[tokio::test]
async fn rotated_token_is_used_on_the_next_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resources/vm-1/state"))
        .and(header("authorization", "Bearer tok-new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cpu": 2})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/resources/vm-1/state"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let vault = vault_with_token("tok-old").await;
    let client = HttpResourceClient::new(server.uri(), CREDENTIAL_ID, vault.clone());
    let err = client.get_state("vm-1").await.unwrap_err();
    assert_eq!(err.into_engine_error("vm-1").kind(), ErrorKind::Authorization);

    vault.rotate(CREDENTIAL_ID, "tok-new").await.unwrap();
    assert!(client.get_state("vm-1").await.is_ok());
}

#[tokio::test]
async fn provider_errors_map_onto_the_taxonomy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resources/vm-busy/state"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/resources/vm-gone/state"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/resources/vm-busy/state"))
        .respond_with(ResponseTemplate::new(409).set_body_string("locked by another writer"))
        .mount(&server)
        .await;

    let client = HttpResourceClient::new(server.uri(), CREDENTIAL_ID, vault_with_token("tok-http").await);

    let busy = client.get_state("vm-busy").await.unwrap_err();
    assert!(busy.is_transient());
    assert_eq!(client.get_state("vm-gone").await.unwrap_err(), AdapterError::NotFound);

    let conflict = client.apply_state("vm-busy", &config(json!({"cpu": 1}))).await.unwrap_err();
    assert_eq!(conflict.into_engine_error("vm-busy").kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn missing_credential_never_reaches_the_provider() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let vault = Arc::new(test_vault(AuditLog::in_memory()));
    let client = HttpResourceClient::new(server.uri(), CREDENTIAL_ID, vault);
    let err = client.get_state("vm-1").await.unwrap_err();
    assert!(matches!(err, AdapterError::Unauthorized { .. }));
}

#[tokio::test]
async fn non_object_state_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resources/vm-1/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2, 3])))
        .mount(&server)
        .await;

    let client = HttpResourceClient::new(server.uri(), CREDENTIAL_ID, vault_with_token("tok-http").await);
    assert!(client.get_state("vm-1").await.is_err());
}

#[tokio::test]
async fn resource_id_stays_inside_its_path_segment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resources/..%2Fadmin%3Fdump%3D1/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cpu": 1})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/admin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"secret": true})))
        .expect(0)
        .mount(&server)
        .await;

    let client = HttpResourceClient::new(server.uri(), CREDENTIAL_ID, vault_with_token("tok-http").await);
    let state = client.get_state("../admin?dump=1").await.unwrap();
    assert_eq!(state, config(json!({"cpu": 1})));

    for unusable in ["..", ".", ""] {
        let err = client.get_state(unusable).await.unwrap_err();
        assert!(matches!(err, AdapterError::ValidationFailed { .. }));
    }
    let err = client.apply_state("..", &config(json!({"cpu": 1}))).await.unwrap_err();
    assert!(matches!(err, AdapterError::ValidationFailed { .. }));
}

#[tokio::test]
async fn webhook_retries_until_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/drift"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks/drift"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let channel = WebhookAlertChannel::new(format!("{}/hooks/drift", server.uri()))
        .with_retry(3, Duration::from_millis(5));
    let alert = Alert::new(
        AlertSource::DriftReport,
        Severity::Critical,
        "vm-1",
        "rpt-1",
        "Critical drift on vm-1",
    );
    channel.deliver(&alert).await.unwrap();

    let received = server.received_requests().await.unwrap();
    let payload: serde_json::Value = received[1].body_json().unwrap();
    assert_eq!(payload["resource_id"], "vm-1");
    assert_eq!(payload["severity"], "critical");
    assert!(payload.get("error_kind").is_none());
}

#[tokio::test]
async fn webhook_gives_up_after_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let channel = WebhookAlertChannel::new(server.uri()).with_retry(2, Duration::from_millis(1));
    let alert = Alert::new(AlertSource::Rollback, Severity::High, "vm-1", "run-1", "Rollback failed");
    assert!(channel.deliver(&alert).await.is_err());
}
