//! Pacing and retry policy for provider calls

use crate::error::ProviderError;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::trace;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Concurrency ceiling plus a global request rate, shared by every provider call
pub struct RequestLimiter {
    permits: Semaphore,
    limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl RequestLimiter {
    pub fn new(max_concurrent: usize, requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1u32));
        Self {
            permits: Semaphore::new(max_concurrent.max(1)),
            limiter: RateLimiter::direct(Quota::per_second(rps)),
        }
    }

    /// Wait for a free slot and for the rate limiter to admit one more request
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, ProviderError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("request limiter closed".to_string()))?;
        self.limiter.until_ready().await;
        trace!(available = self.permits.available_permits(), "Provider slot acquired");
        Ok(permit)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Exponential backoff for retryable provider outcomes
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// Delay before retry number `attempt + 1`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }

    pub fn should_retry(&self, err: &ProviderError, attempt: u32) -> bool {
        err.is_retryable() && attempt < self.max_retries
    }
}
