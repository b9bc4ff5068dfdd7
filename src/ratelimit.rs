use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit wait cancelled")]
    Cancelled,
}

/// Gate in front of a quota-limited provider
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Block until a permit is available or `cancel` fires.
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), RateLimitError>;

    /// Stop replenishing. Permits already available stay usable.
    fn stop(&self);
}

const MIN_REFILL_PERIOD: Duration = Duration::from_nanos(1);

/// Token bucket holding at most `capacity` permits, refilled one at a time
/// every `1/capacity` seconds by a background task. A refill into a full
/// bucket is discarded, so bursts never exceed `capacity`.
pub struct TokenBucket {
    permits: Arc<Semaphore>,
    capacity: usize,
    stop: CancellationToken,
}

impl TokenBucket {
    /// Start a bucket for `qps` requests per second (minimum 1).
    /// Must be called from within a tokio runtime.
    pub fn new(qps: u32) -> Self {
        let capacity = qps.max(1) as usize;
        let permits = Arc::new(Semaphore::new(capacity));
        let stop = CancellationToken::new();
        let period = (Duration::from_secs(1) / capacity as u32).max(MIN_REFILL_PERIOD);

        tokio::spawn(refill(permits.clone(), capacity, period, stop.clone()));

        Self {
            permits,
            capacity,
            stop,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn refill(permits: Arc<Semaphore>, capacity: usize, period: Duration, stop: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("Token bucket refill stopped");
                return;
            }
            _ = ticker.tick() => {
                // Only this task adds permits, so check-then-add cannot overshoot.
                if permits.available_permits() < capacity {
                    permits.add_permits(1);
                }
            }
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RateLimitError::Cancelled),
            permit = self.permits.acquire() => {
                // The semaphore is never closed.
                permit.map_err(|_| RateLimitError::Cancelled)?.forget();
                Ok(())
            }
        }
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_initial_burst_is_capacity() {
        let bucket = TokenBucket::new(5);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..5 {
            bucket.wait(&cancel).await.unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_rate_matches_qps() {
        let bucket = TokenBucket::new(4);
        let cancel = CancellationToken::new();
        for _ in 0..4 {
            bucket.wait(&cancel).await.unwrap();
        }

        let start = Instant::now();
        for _ in 0..4 {
            bucket.wait(&cancel).await.unwrap();
        }
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(999), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1100), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_bucket_never_exceeds_capacity() {
        let bucket = TokenBucket::new(3);
        let cancel = CancellationToken::new();
        bucket.wait(&cancel).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(bucket.available(), bucket.capacity());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_qps_is_clamped_to_one() {
        let bucket = TokenBucket::new(0);
        assert_eq!(bucket.capacity(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_qps_does_not_panic() {
        let bucket = TokenBucket::new(u32::MAX);
        let cancel = CancellationToken::new();
        bucket.wait(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_micros(10)).await;
        assert_eq!(bucket.available(), bucket.capacity());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_cancelled() {
        let bucket = TokenBucket::new(1);
        bucket.stop();
        let cancel = CancellationToken::new();
        bucket.wait(&cancel).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = bucket.wait(&cancel).await.unwrap_err();
        assert_eq!(err, RateLimitError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_bucket_does_not_refill() {
        let bucket = TokenBucket::new(2);
        let cancel = CancellationToken::new();
        bucket.wait(&cancel).await.unwrap();
        bucket.wait(&cancel).await.unwrap();
        bucket.stop();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(bucket.available(), 0);
    }
}
