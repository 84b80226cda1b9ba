//! Automatic error recovery strategies.
//
// Instrument reads during a scan go through `retry_transient`: timeouts and other
// transient failures are retried with a constant backoff, everything else is
// returned immediately.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{AppResult, DaqError};

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use pas_daq::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff: Duration::from_millis(200),
/// };
/// assert_eq!(RetryPolicy::default().max_attempts, 3);
/// # let _ = policy;
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `0` behaves like `1`.
    pub max_attempts: u32,

    /// Constant delay between attempts.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

/// Run `operation`, retrying transient failures according to `policy`.
///
/// Errors for which [`DaqError::is_transient`] is false are returned on first
/// occurrence. When every attempt times out the last error is returned.
///
/// # Example
///
/// ```rust,ignore
/// let (x, y) = retry_transient(&settings.retry, "lock-in read", || lockin.read_xy()).await?;
/// ```
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && tries < max_attempts => {
                tracing::warn!(
                    operation,
                    attempt = tries,
                    max_attempts,
                    error = %err,
                    "Transient failure, retrying"
                );
                sleep(policy.backoff).await;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::error!(operation, attempts = tries, error = %err, "Giving up");
                }
                return Err(err);
            }
        }
    }
}

/// Shorthand for a transient timeout, as produced by transports.
pub fn timeout_error(operation: impl Into<String>, after: Duration) -> DaqError {
    DaqError::Timeout {
        operation: operation.into(),
        after,
    }
}
