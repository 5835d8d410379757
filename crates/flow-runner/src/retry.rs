//! Bounded retry with backoff.
//!
//! Contract: the initial try is not a retry. A policy with `count = N` allows
//! `N + 1` total attempts; retry index 0 is the first retry, and with
//! exponential backoff the delay before retry `k` is `interval * 2^k`.

use std::future::Future;
use std::time::Duration;

use flowpilot_flow_model::{Backoff, RetrySpec};
use tokio::time::sleep;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub count: u32,
    pub interval: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            count: 0,
            interval: Duration::ZERO,
            backoff: Backoff::None,
        }
    }
}

impl From<&RetrySpec> for RetryPolicy {
    fn from(spec: &RetrySpec) -> Self {
        Self {
            count: spec.count,
            interval: Duration::from_millis(spec.interval_ms),
            backoff: spec.backoff,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry with the given 0-based index.
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        match self.backoff {
            Backoff::None => self.interval,
            // Cap the shift; beyond this the delay is already absurd and
            // u32 multiplication would wrap.
            Backoff::Exp => self.interval * (1u32 << retry_index.min(20)),
        }
    }
}

/// Run `op`, retrying per `policy`. `on_retry` is invoked before each delay
/// with the 0-based retry index and the error that triggered it; it is an
/// observability side effect only. After the final attempt the error
/// propagates unmodified.
pub async fn with_retry<T, E, F, Fut, R, RFut>(
    policy: &RetryPolicy,
    mut op: F,
    mut on_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(u32, &E) -> RFut,
    RFut: Future<Output = ()>,
{
    let mut retry_index = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if retry_index >= policy.count {
                    return Err(err);
                }
                on_retry(retry_index, &err).await;
                let delay = policy.delay_for(retry_index);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                retry_index += 1;
            }
        }
    }
}
