//! Token bucket rate limiter for the upstream API
//!
//! One limiter is shared by every fetch worker; the quota is global to the
//! upstream, so tokens are never split per worker. Refill is lazy: each
//! acquisition first credits `elapsed * refill_rate` tokens, capped at the
//! bucket size.
//!
//! Time comes from `tokio::time`, so tests can drive the bucket with a
//! paused clock.

use crate::config::RateLimitConfig;
use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Waiters never re-check the bucket more often than this (20 Hz)
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

const TOKEN_EPSILON: f64 = 1e-9;

/// Token bucket state
#[derive(Debug)]
pub struct TokenBucket {
    /// Burst ceiling
    capacity: f64,
    /// Current available tokens
    tokens: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Last refill time
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(max_tokens: u32, refill_rate_per_second: f64) -> Self {
        Self {
            capacity: max_tokens as f64,
            tokens: max_tokens as f64,
            refill_rate: refill_rate_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let refill_amount = elapsed.as_secs_f64() * self.refill_rate;
        self.tokens = (self.tokens + refill_amount).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one accrues
    pub fn try_take(&mut self) -> std::result::Result<(), Duration> {
        self.refill(Instant::now());

        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            Ok(())
        } else {
            Err(self.time_until_available())
        }
    }

    /// Try to consume a token, returns true if allowed
    pub fn try_acquire(&mut self) -> bool {
        self.try_take().is_ok()
    }

    /// Get time until a token will be available
    pub fn time_until_available(&self) -> Duration {
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            Duration::ZERO
        } else {
            let tokens_needed = 1.0 - self.tokens;
            Duration::from_secs_f64(tokens_needed / self.refill_rate)
        }
    }

    /// Empty the bucket (upstream told us we are over quota)
    pub fn drain(&mut self) {
        self.refill(Instant::now());
        self.tokens = 0.0;
    }
}

/// Serializable snapshot of a limiter
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterState {
    pub tokens: f64,
    pub max_tokens: f64,
    pub refill_rate_per_second: f64,
    pub seconds_since_refill: f64,
}

/// Shared admission gate for upstream requests
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(max_tokens: u32, refill_rate_per_second: f64) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(max_tokens, refill_rate_per_second)),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_tokens, config.refill_rate_per_second())
    }

    /// Non-blocking acquisition
    pub fn try_acquire(&self) -> bool {
        self.bucket.lock().try_acquire()
    }

    /// Wait until a token is available, then take it. Never fails.
    pub async fn acquire(&self) {
        loop {
            let wait = match self.bucket.lock().try_take() {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait.max(MIN_POLL_INTERVAL)).await;
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up when `cancel` fires.
    /// No token is consumed on cancellation.
    pub async fn acquire_cancellable(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled("rate limiter wait cancelled".into()));
            }

            let wait = match self.bucket.lock().try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            debug!("Rate limiter: waiting {:?} for a token", wait);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SyncError::Cancelled("rate limiter wait cancelled".into()));
                }
                _ = tokio::time::sleep(wait.max(MIN_POLL_INTERVAL)) => {}
            }
        }
    }

    /// Drop all accrued tokens so every worker backs off
    pub fn drain(&self) {
        warn!("Rate limiter drained after upstream quota response");
        self.bucket.lock().drain();
    }

    /// Time for one token to accrue at the steady-state rate
    pub fn token_interval(&self) -> Duration {
        let bucket = self.bucket.lock();
        Duration::from_secs_f64(1.0 / bucket.refill_rate)
    }

    pub fn state(&self) -> RateLimiterState {
        let bucket = self.bucket.lock();
        RateLimiterState {
            tokens: bucket.tokens,
            max_tokens: bucket.capacity,
            refill_rate_per_second: bucket.refill_rate,
            seconds_since_refill: bucket.last_refill.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_token_bucket_basic() {
        let mut bucket = TokenBucket::new(10, 2.0);

        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }

        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refill() {
        let mut bucket = TokenBucket::new(100, 100.0);

        for _ in 0..100 {
            bucket.try_acquire();
        }
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_millis(100)).await;

        // ~10 tokens after 0.1s at 100/s
        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_max_tokens() {
        let limiter = RateLimiter::new(5, 2.0);
        tokio::time::advance(Duration::from_secs(3600)).await;

        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_bound_in_mocked_time() {
        let limiter = RateLimiter::new(10, 2.0);
        let start = Instant::now();
        let mut stamps = Vec::with_capacity(500);

        for _ in 0..500 {
            limiter.acquire().await;
            stamps.push(Instant::now());
        }

        // (500 - 10) / 2 = 245 seconds at minimum
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(245), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(300), "elapsed {:?}", elapsed);

        // Any 1s window admits at most the burst plus one second of refill
        for (i, first) in stamps.iter().enumerate() {
            let window_end = *first + Duration::from_secs(1);
            let in_window = stamps[i..].iter().take_while(|t| **t < window_end).count();
            assert!(in_window <= 12, "{} acquisitions within 1s at #{}", in_window, i);
        }

        // After the initial burst the steady state stays under the burst ceiling
        let steady = &stamps[20..];
        for (i, first) in steady.iter().enumerate() {
            let window_end = *first + Duration::from_secs(1);
            let in_window = steady[i..].iter().take_while(|t| **t < window_end).count();
            assert!(in_window <= 10);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_shares_one_bucket() {
        let limiter = Arc::new(RateLimiter::new(10, 2.0));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    limiter.acquire().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 50 acquisitions, 10 from the burst, 40 at 2/s
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_cancellable() {
        let limiter = RateLimiter::new(1, 0.01);
        assert!(limiter.try_acquire());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = limiter.acquire_cancellable(&cancel).await;
        assert!(matches!(result, Err(SyncError::Cancelled(_))));
        assert!(limiter.state().tokens < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain() {
        let limiter = RateLimiter::new(10, 2.0);
        limiter.drain();
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.token_interval(), Duration::from_millis(500));
    }
}
