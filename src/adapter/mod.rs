//! # Resource Client Adapter
//!
//! The live infrastructure control plane reduced to two operations,
//! `get_state` and `apply_state`. Provider SDKs and HTTP APIs are wrapped
//! behind [`ResourceClient`]; the engine only ever sees the
//! [`AdapterError`] taxonomy, never provider payloads.

pub mod http;
pub mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::EngineError;

pub use http::HttpResourceClient;
pub use memory::InMemoryResourceClient;

/// Structured configuration of one resource
pub type ConfigMap = serde_json::Map<String, Value>;

/// Adapter outcome taxonomy
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("resource not found")]
    NotFound,

    #[error("call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("configuration rejected: {message}")]
    ValidationFailed { message: String },

    #[error("conflicting mutation: {message}")]
    Conflict { message: String },

    /// Transport-level failure (connection refused, 5xx)
    #[error("provider unavailable: {message}")]
    Unavailable { message: String },
}

impl AdapterError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::ValidationFailed { message: message.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Timeouts and transport failures may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Timeout { .. } | AdapterError::Unavailable { .. })
    }

    /// Attach the resource id and map onto the engine taxonomy
    pub fn into_engine_error(self, resource_id: &str) -> EngineError {
        match self {
            AdapterError::NotFound => EngineError::not_found("resource", resource_id),
            AdapterError::Timeout { timeout_ms } => {
                EngineError::timeout(format!("adapter call for '{}'", resource_id), timeout_ms)
            }
            AdapterError::Unauthorized { message } => EngineError::authorization(format!(
                "provider rejected credentials for '{}': {}",
                resource_id, message
            )),
            AdapterError::ValidationFailed { message } => EngineError::validation(format!(
                "provider rejected configuration for '{}': {}",
                resource_id, message
            )),
            AdapterError::Conflict { message } => EngineError::conflict(resource_id, message),
            AdapterError::Unavailable { message } => EngineError::transient(resource_id, message),
        }
    }
}

/// Narrow provider interface
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get_state(&self, resource_id: &str) -> Result<ConfigMap, AdapterError>;

    async fn apply_state(&self, resource_id: &str, config: &ConfigMap) -> Result<(), AdapterError>;
}

/// Run an adapter call under the caller's timeout; elapse maps to `Timeout`.
pub async fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout { timeout_ms: timeout.as_millis() as u64 }),
    }
}
