//! Retry policy shared by the fetcher and the batch writer
//!
//! Attempts are retried only when [`SyncError::is_retryable`] says so.
//! Delays grow as `base * 2^(attempt-1)`, capped at `max_delay`; an error
//! carrying a wait hint (HTTP 429) waits for the hint first.

use crate::config::RetryConfig;
use crate::error::{Result, SyncError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Same delays with a different attempt budget
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self::new(max_attempts, self.base_delay, self.max_delay)
    }

    /// Exponential delay after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retrying after `err`: any wait hint plus the standard backoff
    pub fn delay_for(&self, err: &SyncError, attempt: u32) -> Duration {
        let hint = err.retry_after().unwrap_or(Duration::ZERO);
        hint + self.backoff(attempt)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or `cancel` fires. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled(format!("{} cancelled", label)));
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_cancelled() {
                return Err(err);
            }

            if !err.is_retryable() {
                return Err(err);
            }

            if attempt >= self.max_attempts {
                error!(
                    attempt,
                    max_attempts = self.max_attempts,
                    "{}: retries exhausted: {}",
                    label,
                    err
                );
                return Err(SyncError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_for(&err, attempt);
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "{}: retryable error, will retry: {}",
                label,
                err
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SyncError::Cancelled(format!("{} cancelled during backoff", label)));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1000), Duration::from_millis(60_000))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(1000));
        assert_eq!(p.backoff(2), Duration::from_millis(2000));
        assert_eq!(p.backoff(3), Duration::from_millis(4000));
        assert_eq!(p.backoff(20), Duration::from_millis(60_000));
        assert_eq!(p.backoff(64), Duration::from_millis(60_000));
    }

    #[test]
    fn test_delay_adds_retry_after_hint() {
        let p = policy();
        let err = SyncError::Quota {
            retry_after: Some(Duration::from_secs(5)),
            message: "429".into(),
        };
        assert_eq!(p.delay_for(&err, 1), Duration::from_millis(6000));
        let plain = SyncError::transport(Some(503), "unavailable");
        assert_eq!(p.delay_for(&plain, 2), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = Instant::now();

        let result = policy()
            .run("op", &CancellationToken::new(), move |_| async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::transport(Some(502), "bad gateway"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = policy()
            .run("op", &CancellationToken::new(), move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::transport(Some(404), "no such series"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().status_code(), Some(404));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_carries_last_error() {
        let result: Result<()> = policy()
            .run("op", &CancellationToken::new(), |attempt| async move {
                let status = [500u16, 502, 503][attempt as usize - 1];
                Err(SyncError::transport(Some(status), "server error"))
            })
            .await;

        match result {
            Err(SyncError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.status_code(), Some(503));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result: Result<()> = policy()
            .run("op", &cancel, |_| async {
                Err(SyncError::transport(None, "connection refused"))
            })
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled(_))));
    }
}
