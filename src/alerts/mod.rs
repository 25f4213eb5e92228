//! # Alert Delivery
//!
//! The engine's only requirement of a notification channel is `deliver`.
//! Alerts carry the severity, resource id, a one-line summary, the report
//! or run id, and at most the taxonomy kind of a failure. Source chains and
//! stack-level detail stay in the audit log.
//!
//! Delivery failures are logged and swallowed: a broken chat webhook must
//! never fail a scan or a deployment.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::drift::Severity;
use crate::errors::{EngineError, ErrorKind, Result};

/// What raised the alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSource {
    DriftReport,
    DeploymentRun,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub resource_id: String,
    pub summary: String,
    /// Drift report id or deployment run id
    pub reference_id: String,
    pub source: AlertSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl Alert {
    pub fn new(
        source: AlertSource,
        severity: Severity,
        resource_id: impl Into<String>,
        reference_id: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            resource_id: resource_id.into(),
            summary: summary.into(),
            reference_id: reference_id.into(),
            source,
            error_kind: None,
        }
    }

    /// Attach the taxonomy kind of `error`, never its text or sources
    pub fn with_error(mut self, error: &EngineError) -> Self {
        self.error_kind = Some(error.kind());
        self
    }
}

#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<()>;
}

/// Deliver through `channel`, logging instead of propagating failures
pub async fn notify(channel: &dyn AlertChannel, alert: Alert) {
    if let Err(e) = channel.deliver(&alert).await {
        error!(
            resource_id = %alert.resource_id,
            reference_id = %alert.reference_id,
            severity = %alert.severity,
            error = %e,
            "Alert delivery failed"
        );
    }
}

/// Writes alerts to the tracing pipeline
#[derive(Debug, Clone, Default)]
pub struct LogAlertChannel;

#[async_trait]
impl AlertChannel for LogAlertChannel {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        warn!(
            severity = %alert.severity,
            resource_id = %alert.resource_id,
            reference_id = %alert.reference_id,
            error_kind = alert.error_kind.map(|k| k.as_str()),
            "ALERT: {}",
            alert.summary
        );
        Ok(())
    }
}

/// Keeps delivered alerts in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingAlertChannel {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl RecordingAlertChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn alerts_for(&self, resource_id: &str) -> Vec<Alert> {
        self.alerts().into_iter().filter(|a| a.resource_id == resource_id).collect()
    }
}

#[async_trait]
impl AlertChannel for RecordingAlertChannel {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().unwrap_or_else(|p| p.into_inner()).push(alert.clone());
        Ok(())
    }
}

/// POSTs each alert as JSON, retrying a few times with linear backoff
#[derive(Debug, Clone)]
pub struct WebhookAlertChannel {
    client: reqwest::Client,
    url: String,
    max_attempts: u32,
    retry_delay: Duration,
}

impl WebhookAlertChannel {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client, url: url.into(), max_attempts: 3, retry_delay: Duration::from_secs(1) }
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    async fn send(&self, alert: &Alert) -> Result<reqwest::StatusCode> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| EngineError::internal(format!("Webhook delivery failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::internal(format!(
                "Webhook endpoint returned error status: {}",
                status
            )));
        }
        Ok(status)
    }
}

#[async_trait]
impl AlertChannel for WebhookAlertChannel {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.send(alert).await {
                Ok(status) => {
                    info!(
                        reference_id = %alert.reference_id,
                        status_code = status.as_u16(),
                        attempt,
                        "Alert webhook delivered"
                    );
                    return Ok(());
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!(error = %e, attempt, "Alert webhook failed, retrying");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Delivers to every channel; fails only if all of them fail
#[derive(Clone, Default)]
pub struct FanoutAlertChannel {
    channels: Vec<Arc<dyn AlertChannel>>,
}

impl FanoutAlertChannel {
    pub fn new(channels: Vec<Arc<dyn AlertChannel>>) -> Self {
        Self { channels }
    }

    pub fn push(&mut self, channel: Arc<dyn AlertChannel>) {
        self.channels.push(channel);
    }
}

#[async_trait]
impl AlertChannel for FanoutAlertChannel {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let mut last_error = None;
        let mut delivered = 0;
        for channel in &self.channels {
            match channel.deliver(alert).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(error = %e, "Alert channel failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }
}
