//! Bounded retry with exponential backoff
//!
//! Provisioning calls against the control plane race its eventual
//! consistency: a freshly minted identity or role is not immediately
//! visible to the next API. Calls wrapped here pay a base delay up front
//! (mirroring that propagation lag) and are retried with doubling backoff,
//! but only when the failure is classified [`ErrorKind::Transient`].

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::provider::{ErrorKind, ProviderError};

/// Retry budget for one provisioning call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the first attempt; doubles before each retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No delays at all; for tests and for callers that handle lag themselves.
    pub fn immediate() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::ZERO,
        }
    }
}

/// Run `call` under `policy`, retrying transient failures only.
///
/// Validation and permission errors surface immediately. When the budget is
/// exhausted the last transient error is returned annotated with the number
/// of attempts spent.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.base_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is(ErrorKind::Transient) => {
                if attempt >= attempts {
                    return Err(err.after_attempts(attempt));
                }
                warn!(
                    operation = %operation,
                    attempt = attempt,
                    error = %err,
                    "transient failure, backing off"
                );
                delay = if delay.is_zero() {
                    Duration::ZERO
                } else {
                    delay.saturating_mul(2)
                };
            }
            Err(err) => return Err(err),
        }
    }
}
