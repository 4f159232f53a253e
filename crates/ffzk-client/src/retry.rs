//! Exponential backoff retry for transient connectivity failures

use crate::error::{ClientError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Shift bound so `1 << (n + 1)` cannot overflow
const MAX_RETRY_SHIFT: u32 = 29;

/// Retry policy that sleeps `base * random(1..2^(n+1))` between attempts,
/// never longer than `max_sleep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base_sleep: Duration,
    max_sleep: Duration,
    max_retries: u32,
}

impl ExponentialBackoff {
    pub fn new(base_sleep: Duration, max_sleep: Duration, max_retries: u32) -> Self {
        Self {
            base_sleep,
            max_sleep,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether another attempt is allowed after `retry_count` retries
    pub fn allow_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Backoff before retry number `retry_count` (zero based)
    pub fn sleep_time(&self, retry_count: u32) -> Duration {
        let shift = retry_count.min(MAX_RETRY_SHIFT) + 1;
        let factor = rand::thread_rng().gen_range(0..(1u32 << shift)).max(1);
        self.base_sleep
            .saturating_mul(factor)
            .min(self.max_sleep)
    }
}

/// Run `operation` until it succeeds, fails permanently, or retries run out.
///
/// Transient failures that outlive the policy become
/// [`ClientError::CoordinationUnavailable`].
pub async fn call_with_retry<T, F, Fut>(
    policy: &ExponentialBackoff,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry_count = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if !policy.allow_retry(retry_count) {
                    tracing::warn!(
                        "{} failed after {} attempts: {}",
                        operation,
                        retry_count + 1,
                        e
                    );
                    return Err(ClientError::unavailable(retry_count + 1));
                }
                let delay = policy.sleep_time(retry_count);
                tracing::debug!(
                    "{} failed ({}), retrying in {:?}",
                    operation,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
