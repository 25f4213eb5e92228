//! HTTP provider adapter.
//!
//! `GET {base}/resources/{id}/state` returns the configuration object;
//! `PUT {base}/resources/{id}/state` applies one. The id is sent as a single
//! percent-encoded path segment. The bearer token is read from the vault on
//! every call so rotations take effect immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{AdapterError, ConfigMap, ResourceClient};
use crate::secrets::SecretsVault;

/// Provider client over a JSON HTTP API
#[derive(Clone)]
pub struct HttpResourceClient {
    client: reqwest::Client,
    base_url: String,
    credential_id: String,
    vault: Arc<SecretsVault>,
}

impl std::fmt::Debug for HttpResourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResourceClient")
            .field("base_url", &self.base_url)
            .field("credential_id", &self.credential_id)
            .finish()
    }
}

impl HttpResourceClient {
    pub fn new(
        base_url: impl Into<String>,
        credential_id: impl Into<String>,
        vault: Arc<SecretsVault>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential_id: credential_id.into(),
            vault,
        }
    }

    fn state_url(&self, resource_id: &str) -> Result<String, AdapterError> {
        // Dot segments would be resolved away by the URL parser
        if matches!(resource_id, "" | "." | "..") {
            return Err(AdapterError::validation_failed(format!(
                "resource id '{}' is not a valid path segment",
                resource_id
            )));
        }
        Ok(format!(
            "{}/resources/{}/state",
            self.base_url,
            urlencoding::encode(resource_id)
        ))
    }

    async fn bearer_token(&self) -> Result<String, AdapterError> {
        self.vault
            .retrieve(&self.credential_id)
            .await
            .map(|token| token.expose_secret().to_string())
            .map_err(|e| {
                AdapterError::unauthorized(format!(
                    "credential '{}' unavailable: {}",
                    self.credential_id, e
                ))
            })
    }
}

/// Map a non-success HTTP status onto the adapter taxonomy
pub fn status_to_error(status: StatusCode, body: &str) -> AdapterError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        // Provider payloads are opaque; keep only a short excerpt
        format!("{}: {}", status, body.chars().take(200).collect::<String>())
    };

    match status {
        StatusCode::NOT_FOUND => AdapterError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdapterError::unauthorized(message),
        StatusCode::CONFLICT => AdapterError::conflict(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            AdapterError::validation_failed(message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            AdapterError::Timeout { timeout_ms: 0 }
        }
        _ => AdapterError::unavailable(message),
    }
}

fn transport_error(error: reqwest::Error) -> AdapterError {
    if error.is_timeout() {
        AdapterError::Timeout { timeout_ms: 0 }
    } else {
        AdapterError::unavailable(error.to_string())
    }
}

#[async_trait]
impl ResourceClient for HttpResourceClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn get_state(&self, resource_id: &str) -> Result<ConfigMap, AdapterError> {
        let url = self.state_url(resource_id)?;
        let token = self.bearer_token().await?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = status_to_error(status, &body);
            warn!(resource_id = %resource_id, status = status.as_u16(), "Provider get_state failed");
            return Err(error);
        }

        match response.json::<Value>().await.map_err(transport_error)? {
            Value::Object(config) => {
                debug!(resource_id = %resource_id, fields = config.len(), "Provider state fetched");
                Ok(config)
            }
            other => Err(AdapterError::unavailable(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    #[instrument(skip(self, config), fields(base_url = %self.base_url))]
    async fn apply_state(&self, resource_id: &str, config: &ConfigMap) -> Result<(), AdapterError> {
        let url = self.state_url(resource_id)?;
        let token = self.bearer_token().await?;
        let response = self
            .client
            .put(url)
            .bearer_auth(token)
            .json(config)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(resource_id = %resource_id, status = status.as_u16(), "Provider apply_state failed");
            return Err(status_to_error(status, &body));
        }

        debug!(resource_id = %resource_id, "Provider state applied");
        Ok(())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
