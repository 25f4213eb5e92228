//! # State Collector
//!
//! Reads live state through the [`ResourceClient`] and normalises it into
//! the baseline schema. Transient adapter failures are retried with
//! exponential backoff; a resource that never answers surfaces as
//! [`EngineError::CollectionFailed`] without affecting the rest of a batch.

pub mod normalize;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::adapter::{call_with_timeout, ConfigMap, ResourceClient};
use crate::config::CollectorConfig;
use crate::errors::{EngineError, Result};
use crate::observability::MetricsRecorder;

pub use normalize::{FieldNormalizer, NormalizationRules, RenameRule, ScaleRule};
pub use retry::RetryPolicy;

/// Freshly collected, normalised state of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStateRecord {
    pub resource_id: String,
    pub config: ConfigMap,
    pub collected_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StateCollector {
    client: Arc<dyn ResourceClient>,
    normalizer: FieldNormalizer,
    retry: RetryPolicy,
    call_timeout: Duration,
    max_concurrency: usize,
    metrics: MetricsRecorder,
}

impl std::fmt::Debug for StateCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCollector")
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl StateCollector {
    pub fn new(client: Arc<dyn ResourceClient>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            client,
            normalizer: FieldNormalizer::default(),
            retry,
            call_timeout,
            max_concurrency: 8,
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn from_config(client: Arc<dyn ResourceClient>, config: &CollectorConfig) -> Self {
        Self::new(client, RetryPolicy::from(config), config.call_timeout())
            .with_normalizer(FieldNormalizer::new(config.normalization.clone()))
            .with_max_concurrency(config.max_concurrency)
    }

    pub fn with_normalizer(mut self, normalizer: FieldNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn client(&self) -> &Arc<dyn ResourceClient> {
        &self.client
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Collect one resource, retrying transient failures.
    #[instrument(skip(self), fields(resource_id = %resource_id))]
    pub async fn collect(&self, resource_id: &str) -> Result<LiveStateRecord> {
        let mut attempt = 0u32;

        loop {
            let delay = self.retry.backoff_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;

            let outcome =
                call_with_timeout(self.call_timeout, self.client.get_state(resource_id)).await;

            match outcome {
                Ok(raw) => {
                    debug!(attempt, "Collected live state");
                    return Ok(LiveStateRecord {
                        resource_id: resource_id.to_string(),
                        config: self.normalizer.normalize(raw),
                        collected_at: Utc::now(),
                    });
                }
                Err(error) if error.is_transient() => {
                    if attempt >= self.retry.max_attempts {
                        warn!(attempt, error = %error, "Collection retries exhausted");
                        return Err(EngineError::CollectionFailed {
                            resource_id: resource_id.to_string(),
                            attempts: attempt,
                            message: error.to_string(),
                        });
                    }
                    debug!(attempt, error = %error, "Transient collection failure, retrying");
                    self.metrics.record_collection_retry(attempt);
                }
                Err(error) => return Err(error.into_engine_error(resource_id)),
            }
        }
    }

    /// One attempt under `timeout`, no retries
    #[instrument(skip(self, timeout), fields(resource_id = %resource_id))]
    pub async fn collect_once(
        &self,
        resource_id: &str,
        timeout: Duration,
    ) -> Result<LiveStateRecord> {
        let raw = call_with_timeout(timeout, self.client.get_state(resource_id))
            .await
            .map_err(|e| e.into_engine_error(resource_id))?;
        Ok(LiveStateRecord {
            resource_id: resource_id.to_string(),
            config: self.normalizer.normalize(raw),
            collected_at: Utc::now(),
        })
    }

    /// Collect a batch with bounded concurrency. Results are per resource
    /// and in input order; one failure never aborts the batch.
    pub async fn collect_all(&self, resource_ids: &[String]) -> Vec<Result<LiveStateRecord>> {
        let mut indexed = stream::iter(resource_ids.iter().cloned().enumerate())
            .map(|(index, id)| {
                let collector = self.clone();
                async move { (index, collector.collect(&id).await) }
            })
            .buffer_unordered(self.max_concurrency)
            .collect::<Vec<(usize, Result<LiveStateRecord>)>>()
            .await;

        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, result)| result).collect()
    }
}
