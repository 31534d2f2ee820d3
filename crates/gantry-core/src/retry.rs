//! Bounded exponential backoff shared by runtime and API boundaries.

use std::future::Future;
use std::time::Duration;

/// Retry policy: `attempts` total tries, delays growing from `base` by
/// `factor` up to `cap`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 5,
            base: Duration::from_millis(100),
            factor: 2,
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay before the given retry (0-indexed over retries, not tries).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.factor.saturating_pow(retry);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Run `op` until it succeeds, the error is not retriable, or attempts are
/// exhausted. The terminal error is returned as-is; callers promote
/// transient errors with [`crate::Error::exhausted`].
pub async fn retry<T, E, F, Fut, P>(policy: Backoff, mut op: F, retriable: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.attempts.max(1) || !retriable(&err) {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay(attempt - 1)).await;
            }
        }
    }
}
