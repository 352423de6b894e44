//! Retry with exponential backoff for transient write failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3).
    pub max_retries: u32,
    /// Initial backoff in milliseconds (default: 100).
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds (default: 10 seconds).
    pub max_backoff_ms: u64,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    ///
    /// Jitter scales the delay by a random factor in `[0.5, 1.0]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64).max(0.0);
        let ms = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_millis(ms as u64)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error,
/// or the retry budget runs out.
///
/// A non-retryable error is returned as is. Running out of retries wraps the
/// last error in [`ClientError::RetriesExhausted`].
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, mut operation: F) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt > config.max_retries => {
                return Err(ClientError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(e),
                })
            }
            Err(e) => {
                let backoff = config.backoff(attempt - 1);
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
