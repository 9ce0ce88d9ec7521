// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded exponential backoff.
//!
//! Two kinds of retry live here:
//! - [`retry()`] re-runs an async operation in-process (connecting, publishing).
//! - [`requeue_delay()`] computes how long a requeued backlog entry waits before it is
//!   claimable again. The entry itself carries the retry budget; no worker blocks.
//!
//! # Example
//!
//! ```
//! use indexing_pipeline::RetryConfig;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! let publish = RetryConfig::publish();
//! assert_eq!(publish.max_retries, Some(4));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for operation retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail for initial connections, so misconfiguration surfaces quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Stream publishes. A publish that still fails is skipped for this tick or
    /// left to message redelivery.
    #[must_use]
    pub fn publish() -> Self {
        Self {
            max_retries: Some(4),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            factor: 2.0,
        }
    }

    /// Individual storage queries.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Minimal delays for tests
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

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

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        warn!(operation = operation_name, attempts, error = %err, "Giving up");
                        return Err(err);
                    }
                }

                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    error = %err,
                    next_in = ?delay,
                    "Operation failed, retrying"
                );

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

/// Delay before a requeued entry may be claimed again after its `attempts`-th
/// transient failure: `base * 2^(attempts-1)`, capped at `max`.
///
/// ```
/// use indexing_pipeline::resilience::retry::requeue_delay;
/// use std::time::Duration;
///
/// let base = Duration::from_secs(60);
/// let max = Duration::from_secs(3600);
/// assert_eq!(requeue_delay(1, base, max), Duration::from_secs(60));
/// assert_eq!(requeue_delay(3, base, max), Duration::from_secs(240));
/// assert_eq!(requeue_delay(20, base, max), max);
/// ```
pub fn requeue_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}
