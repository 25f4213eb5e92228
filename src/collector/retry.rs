//! Exponential backoff for adapter calls.

use std::time::Duration;

use crate::config::CollectorConfig;

/// Retry schedule for transient adapter failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_backoff: Duration,
    /// Cap on any single delay
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl From<&CollectorConfig> for RetryPolicy {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// No retries, no delay
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before attempt `attempt` (0-indexed); the first attempt waits 0.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = self.multiplier.powi(attempt as i32 - 1);
        let backoff_ms = self.base_backoff.as_millis() as f64 * factor;
        let capped_ms = backoff_ms.min(self.max_backoff.as_millis() as f64);

        Duration::from_millis(capped_ms as u64)
    }
}
