//! Series fetcher
//!
//! Wraps upstream calls with the shared rate limiter and retry policy.
//! Every page costs one limiter token; a 429 drains the bucket so sibling
//! workers back off too, and without a `Retry-After` hint the retry waits
//! one token interval on top of the standard backoff.

use crate::error::{Result, SyncError};
use crate::sync::rate_limiter::RateLimiter;
use crate::sync::retry::RetryPolicy;
use crate::types::RawObservation;
use crate::upstream::{ObservationRequest, SeriesSource};
use chrono::NaiveDate;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Hard stop for runaway pagination
const MAX_PAGES: u32 = 10_000;

pub struct SeriesFetcher {
    source: Arc<dyn SeriesSource>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    page_size: u32,
}

impl SeriesFetcher {
    pub fn new(
        source: Arc<dyn SeriesSource>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        page_size: u32,
    ) -> Self {
        Self {
            source,
            limiter,
            retry,
            page_size: page_size.max(1),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fetch every observation from `start` through the latest available
    pub async fn fetch(
        &self,
        series_id: &str,
        start: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawObservation>> {
        self.fetch_range(series_id, start, None, cancel).await
    }

    /// Fetch observations in `[start, end]`, following pages until a short page
    pub async fn fetch_range(
        &self,
        series_id: &str,
        start: NaiveDate,
        end: Option<NaiveDate>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawObservation>> {
        let mut rows = Vec::new();
        let mut offset = 0u32;

        for page in 0..MAX_PAGES {
            let request = ObservationRequest {
                series_id: series_id.to_string(),
                observation_start: start,
                observation_end: end,
                limit: self.page_size,
                offset,
            };

            let batch = self.fetch_page_with_retry(&request, cancel).await?;
            let received = batch.len();
            rows.extend(batch);

            debug!(
                series_id,
                page,
                received,
                "Fetched page from {}",
                self.source.id()
            );

            if received < self.page_size as usize {
                break;
            }
            offset = offset.saturating_add(received as u32);
        }

        info!(
            "Fetched {} raw observations for {} from {}",
            rows.len(),
            series_id,
            start
        );
        Ok(rows)
    }

    async fn fetch_page_with_retry(
        &self,
        request: &ObservationRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawObservation>> {
        let label = format!("fetch {}", request.series_id);
        let limiter = &self.limiter;
        let source = &self.source;

        self.retry
            .run(&label, cancel, move |_attempt| async move {
                limiter.acquire_cancellable(cancel).await?;

                let response = tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(SyncError::Cancelled(format!(
                            "request for {} cancelled",
                            request.series_id
                        )));
                    }
                    response = source.fetch_page(request) => response,
                };

                match response {
                    Err(SyncError::Quota {
                        retry_after,
                        message,
                    }) => {
                        limiter.drain();
                        Err(SyncError::Quota {
                            retry_after: Some(
                                retry_after.unwrap_or_else(|| limiter.token_interval()),
                            ),
                            message,
                        })
                    }
                    other => other,
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{InjectedFailure, MemorySource};
    use std::time::Duration;
    use tokio::time::Instant;

    fn rows(n: usize) -> Vec<RawObservation> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        (0..n)
            .map(|i| {
                let date = start + chrono::Duration::days(i as i64);
                RawObservation::new(date.to_string(), format!("{}.0", i))
            })
            .collect()
    }

    fn fetcher(source: Arc<MemorySource>, page_size: u32) -> SeriesFetcher {
        SeriesFetcher::new(
            source,
            Arc::new(RateLimiter::new(10, 2.0)),
            RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(5)),
            page_size,
        )
    }

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_paginates_until_short_page() {
        let source = Arc::new(MemorySource::new());
        source.insert_series("DGS10", rows(5));

        let fetched = fetcher(source.clone(), 2)
            .fetch("DGS10", start(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fetched.len(), 5);
        assert_eq!(source.request_count("DGS10"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let source = Arc::new(MemorySource::new());
        source.insert_series("DGS10", rows(3));
        source.inject_failures(
            "DGS10",
            vec![InjectedFailure::Status(503), InjectedFailure::ConnectionReset],
        );

        let fetched = fetcher(source.clone(), 100)
            .fetch("DGS10", start(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fetched.len(), 3);
        assert_eq!(source.request_count("DGS10"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_fails_immediately() {
        let source = Arc::new(MemorySource::new());
        source.insert_series("DGS10", rows(3));
        source.inject_failures("DGS10", vec![InjectedFailure::Status(404)]);

        let err = fetcher(source.clone(), 100)
            .fetch("DGS10", start(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), Some(404));
        assert_eq!(source.request_count("DGS10"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_carry_last_status() {
        let source = Arc::new(MemorySource::new());
        source.insert_series("DGS10", rows(3));
        source.inject_failures(
            "DGS10",
            vec![
                InjectedFailure::Status(500),
                InjectedFailure::Status(502),
                InjectedFailure::Status(504),
            ],
        );

        let err = fetcher(source.clone(), 100)
            .fetch("DGS10", start(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.status_code(), Some(504));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_without_hint_waits_for_limiter() {
        let source = Arc::new(MemorySource::new());
        source.insert_series("DGS10", rows(3));
        source.inject_failures("DGS10", vec![InjectedFailure::RateLimited(None)]);

        let fetcher = fetcher(source.clone(), 100);
        let begin = Instant::now();
        let fetched = fetcher
            .fetch("DGS10", start(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fetched.len(), 3);
        // token interval (500ms) + backoff (100ms), then the drained bucket
        assert!(begin.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_respects_retry_after() {
        let source = Arc::new(MemorySource::new());
        source.insert_series("DGS10", rows(3));
        source.inject_failures(
            "DGS10",
            vec![InjectedFailure::RateLimited(Some(Duration::from_secs(30)))],
        );

        let begin = Instant::now();
        fetcher(source, 100)
            .fetch("DGS10", start(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(begin.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetch() {
        let source = Arc::new(MemorySource::new());
        source.insert_series("DGS10", rows(3));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher(source, 100)
            .fetch("DGS10", start(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_stalled_request() {
        let source = Arc::new(MemorySource::new());
        source.insert_series("DGS10", rows(3));
        source.inject_failures("DGS10", vec![InjectedFailure::Delay(Duration::from_secs(600))]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = fetcher(source.clone(), 100)
            .fetch("DGS10", start(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(source.request_count("DGS10"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_response_still_arrives() {
        let source = Arc::new(MemorySource::new());
        source.insert_series("DGS10", rows(3));
        source.inject_failures("DGS10", vec![InjectedFailure::Delay(Duration::from_secs(30))]);

        let fetched = fetcher(source, 100)
            .fetch("DGS10", start(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fetched.len(), 3);
    }
}
