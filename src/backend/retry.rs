//! Retry policy for calls to the database service
//!
//! Exponential backoff: `initial * multiplier^retry`, capped at `max_backoff`.

use crate::backend::BackendError;
use crate::config::DatabaseServiceSettings;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(settings: &DatabaseServiceSettings) -> Self {
        Self {
            max_attempts: settings.retry_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.retry_backoff_ms),
            ..Self::default()
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Whether another attempt should follow failed attempt number `attempt`
    /// (1-based).
    pub fn should_retry(&self, error: &BackendError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Delay before the retry that follows attempt number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff.as_millis() as f64) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}
