//! Retry policy executor for transient provider errors.
//!
//! Wraps a remote call with bounded backoff keyed on the response status:
//! 429 and 5xx retry with a delay that scales *linearly* with the attempt
//! index (`base * attempt`, not doubling); everything else rethrows
//! immediately. Retries sleep locally to the call; concurrent connections
//! are not throttled against each other here.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::providers::{ProviderError, Result};

/// Bounded linear-backoff retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_429: Duration,
    base_5xx: Duration,
}

impl RetryPolicy {
    /// Builds a policy from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_429: config.base_429(),
            base_5xx: config.base_5xx(),
        }
    }

    /// Preset tuned for the Gmail API quota behavior.
    pub fn gmail() -> Self {
        Self {
            max_attempts: 3,
            base_429: Duration::from_secs(2),
            base_5xx: Duration::from_secs(1),
        }
    }

    /// Preset tuned for Microsoft Graph throttling.
    pub fn graph() -> Self {
        Self {
            max_attempts: 3,
            base_429: Duration::from_secs(3),
            base_5xx: Duration::from_secs(1),
        }
    }

    /// Generic preset for providers without documented quota behavior.
    pub fn generic() -> Self {
        Self {
            max_attempts: 3,
            base_429: Duration::from_secs(2),
            base_5xx: Duration::from_secs(2),
        }
    }

    /// Maximum attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The delay before re-attempting after a failure on `attempt`
    /// (1-based), or `None` when the error is not retryable.
    fn retry_delay(&self, error: &ProviderError, attempt: u32) -> Option<Duration> {
        match error.status_code() {
            Some(429) => Some(self.base_429 * attempt),
            Some(status) if (500..=599).contains(&status) => Some(self.base_5xx * attempt),
            _ => None,
        }
    }

    /// Executes `f`, retrying on transient errors up to the attempt bound.
    ///
    /// On eventual success the retries are invisible to the caller; once
    /// the bound is exhausted the final error is returned as-is.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let delay = match self.retry_delay(&error, attempt) {
                        Some(delay) if attempt < self.max_attempts => delay,
                        _ => return Err(error),
                    };
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
