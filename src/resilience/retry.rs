// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Used in two places: adapters retry connection setup with
//! [`retry_backend`], and the operation queue computes per-operation backoff
//! with [`RetryConfig::delay_for_attempt`].
//!
//! # Example
//!
//! ```
//! use multistore_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! let backoff = RetryConfig::backoff(Duration::from_secs(1), Duration::from_secs(60));
//! assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
//! assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::backend::BackendError;

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries forever
    pub max_retries: Option<usize>,
}

impl RetryConfig {
    /// Fast-fail retry for connecting at startup; surfaces bad config in seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Doubling backoff between `base` and `max`, no attempt limit.
    #[must_use]
    pub fn backoff(base: Duration, max: Duration) -> Self {
        Self {
            max_retries: None,
            initial_delay: base,
            max_delay: max,
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay before the given (1-based) retry attempt, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = (self.initial_delay.as_nanos() as f64 * self.factor.powi(exp)).round();
        let capped = scaled.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }
}

/// Run `operation` until it succeeds or the retry budget is spent.
///
/// Gives up immediately on non-retryable backend errors.
pub async fn retry_backend<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    retry_while(operation_name, config, operation, |e: &BackendError| e.kind().is_retryable()).await
}

async fn retry_while<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0usize;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if !should_retry(&err) {
                    return Err(err);
                }
                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max = ?config.max_retries,
                    error = %err,
                    next_in = ?delay,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}
