//! Exponential backoff retry policy
//!
//! Sleep before retry `n` (0-based) is `base_sleep * max(1, rand(0..2^(n+1)))`,
//! capped at `max_sleep`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Result;

/// Retry policy for coordination calls
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base sleep between attempts
    pub base_sleep: Duration,
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Upper bound for a single sleep
    pub max_sleep: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_sleep: Duration::from_millis(1000),
            max_retries: 5,
            max_sleep: Duration::from_secs(30),
        }
    }
}

impl ExponentialBackoff {
    /// Create a policy with the default sleep cap
    pub fn new(base_sleep: Duration, max_retries: u32) -> Self {
        Self {
            base_sleep,
            max_retries,
            ..Default::default()
        }
    }

    /// Sleep to apply before the given retry
    pub fn delay_for(&self, retry: u32) -> Duration {
        // Cap the shift so the range stays well inside u32
        let span = 1u32 << (retry.min(29) + 1);
        let factor = rand::thread_rng().gen_range(0..span).max(1);
        self.base_sleep
            .saturating_mul(factor)
            .min(self.max_sleep)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    let delay = self.delay_for(retries);
                    tracing::debug!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        what,
                        e,
                        retries + 1,
                        self.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
