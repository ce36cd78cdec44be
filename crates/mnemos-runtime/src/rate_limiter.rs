//! Token-bucket guard in front of the embedding provider.
//!
//! Backed by governor's GCRA limiter, which is equivalent to a token bucket
//! whose capacity equals the per-second rate: a full bucket grants `rate`
//! requests at once, then one more every `1/rate` seconds.

use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use mnemos_types::error::{MnemosError, MnemosResult};
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared, process-wide limiter for provider calls.
pub struct ProviderRateLimiter {
    limiter: DirectRateLimiter,
    rate: NonZeroU32,
}

impl ProviderRateLimiter {
    /// Limiter granting `per_second` requests per second (minimum 1).
    pub fn per_second(per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            rate,
        }
    }

    /// Burst capacity of the bucket.
    pub fn capacity(&self) -> u32 {
        self.rate.get()
    }

    /// Take a token if one is available right now.
    pub fn try_take(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait up to `timeout` for a token. Returns whether one was granted.
    pub async fn try_acquire(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.limiter.until_ready())
            .await
            .is_ok()
    }

    /// Wait up to `timeout` for a token, failing with `RateLimited`.
    pub async fn acquire(&self, timeout: Duration) -> MnemosResult<()> {
        let started = Instant::now();
        if self.try_acquire(timeout).await {
            let waited = started.elapsed();
            if waited > Duration::from_millis(50) {
                debug!(waited_ms = waited.as_millis() as u64, "Waited for provider rate limit");
            }
            Ok(())
        } else {
            let waited_ms = started.elapsed().as_millis() as u64;
            warn!(waited_ms, rate = self.rate.get(), "Provider rate limit acquisition timed out");
            Err(MnemosError::RateLimited { waited_ms })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_capacity_is_rate() {
        let limiter = ProviderRateLimiter::per_second(10);
        let granted = (0..25).filter(|_| limiter.try_take()).count();
        assert_eq!(granted, 10);
        assert_eq!(limiter.capacity(), 10);
    }

    #[tokio::test]
    async fn test_sequential_acquires_are_paced() {
        let limiter = ProviderRateLimiter::per_second(10);
        let started = Instant::now();
        for _ in 0..50 {
            limiter.acquire(Duration::from_secs(5)).await.unwrap();
        }
        // 10 from the full bucket, 40 more at 100ms each.
        assert!(started.elapsed() >= Duration::from_millis(3_800));
    }

    #[tokio::test]
    async fn test_acquire_timeout_is_rate_limited() {
        let limiter = ProviderRateLimiter::per_second(1);
        assert!(limiter.try_take());
        let err = limiter.acquire(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, MnemosError::RateLimited { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_zero_rate_clamps_to_one() {
        let limiter = ProviderRateLimiter::per_second(0);
        assert_eq!(limiter.capacity(), 1);
        assert!(limiter.try_take());
    }
}
