//! Batch write engine
//!
//! Deduplicates a batch by date, then upserts it in ascending fixed-size
//! chunks. Each chunk is retried on its own; a chunk that still fails is
//! recorded and the remaining chunks carry on. When the failed share of a
//! batch exceeds `error_rate_threshold`, the failed rows are re-chunked at
//! half the size, down to `min_chunk_size` and finally row by row, so a few
//! poison rows do not take their neighbours with them.

use crate::config::BatchConfig;
use crate::error::{Result, SyncError};
use crate::sync::retry::RetryPolicy;
use crate::types::Observation;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of writing one chunk in one transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub inserted: usize,
    /// Existing rows whose value changed
    pub updated: usize,
    /// Existing rows rewritten with the same value
    pub unchanged: usize,
}

/// Keyed observation storage with atomic upsert-on-conflict.
///
/// Calls are blocking; the writer runs them on the blocking pool.
pub trait ObservationStore: Send + Sync {
    /// Upsert `rows` in one transaction keyed on `(series_id, date)`,
    /// updating the value of existing keys
    fn upsert_chunk(&self, series_id: &str, rows: &[Observation]) -> Result<ChunkOutcome>;

    /// Stored observations in ascending date order
    fn query_range(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<Observation>>;

    fn existing_dates(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<NaiveDate>>;

    fn latest_date(&self, series_id: &str) -> Result<Option<NaiveDate>>;

    fn earliest_date(&self, series_id: &str) -> Result<Option<NaiveDate>>;

    fn count(&self, series_id: &str) -> Result<usize>;

    /// Row count and stored span, `None` for a series with no rows
    fn coverage(&self, series_id: &str) -> Result<Option<SeriesCoverage>> {
        let count = self.count(series_id)?;
        if count == 0 {
            return Ok(None);
        }
        match (self.earliest_date(series_id)?, self.latest_date(series_id)?) {
            (Some(first_date), Some(last_date)) => Ok(Some(SeriesCoverage {
                series_id: series_id.to_string(),
                count,
                first_date,
                last_date,
            })),
            _ => Ok(None),
        }
    }
}

/// What the store holds for one series
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesCoverage {
    pub series_id: String,
    pub count: usize,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
}

/// Rows that could not be written
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFailure {
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub rows: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Rows dropped before writing: "no data" markers and in-batch duplicates
    pub skipped: usize,
    pub errors: Vec<WriteFailure>,
    /// Newest date of the written prefix: every row up to and including it
    /// is stored, and the first failed row (if any) comes after it.
    /// `None` when nothing was written.
    pub written_through: Option<NaiveDate>,
}

impl UpsertOutcome {
    fn absorb(&mut self, chunk: ChunkOutcome) {
        self.inserted += chunk.inserted;
        self.updated += chunk.updated;
        self.unchanged += chunk.unchanged;
    }

    pub fn failed_rows(&self) -> usize {
        self.errors.iter().map(|e| e.rows).sum()
    }

    pub fn written(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// Collapse duplicate dates (last occurrence wins) and drop "no data" rows.
/// Returns the ascending rows and how many were skipped.
pub fn dedupe_batch(batch: Vec<Observation>) -> (Vec<Observation>, usize) {
    let total = batch.len();
    let mut by_date: BTreeMap<NaiveDate, Observation> = BTreeMap::new();
    for obs in batch {
        by_date.insert(obs.date, obs);
    }

    let rows: Vec<Observation> = by_date
        .into_values()
        .filter(|o| o.value.is_some())
        .collect();
    let skipped = total - rows.len();
    (rows, skipped)
}

pub struct BatchWriter {
    store: Arc<dyn ObservationStore>,
    retry: RetryPolicy,
    chunk_size: usize,
    min_chunk_size: usize,
    error_rate_threshold: f64,
    /// Shared across every series so store connections stay bounded
    permits: Arc<Semaphore>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn ObservationStore>, config: &BatchConfig, retry: &RetryPolicy) -> Self {
        let chunk_size = config.chunk_size.max(1);
        Self {
            store,
            retry: retry.with_max_attempts(config.max_retries.max(1)),
            chunk_size,
            min_chunk_size: config.min_chunk_size.clamp(1, chunk_size),
            error_rate_threshold: config.error_rate_threshold,
            permits: Arc::new(Semaphore::new(config.max_concurrent_writes.max(1))),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObservationStore> {
        &self.store
    }

    /// Deduplicate and upsert `batch` for `series_id`.
    ///
    /// Only cancellation aborts the call; every other failure ends up in
    /// [`UpsertOutcome::errors`].
    pub async fn upsert(
        &self,
        series_id: &str,
        batch: Vec<Observation>,
        cancel: &CancellationToken,
    ) -> Result<UpsertOutcome> {
        let (rows, skipped) = dedupe_batch(batch);
        let total = rows.len();
        let mut outcome = UpsertOutcome {
            skipped,
            ..Default::default()
        };
        if rows.is_empty() {
            return Ok(outcome);
        }

        let mut chunk_size = self.chunk_size;
        let mut pending: Vec<Vec<Observation>> =
            rows.chunks(chunk_size).map(|c| c.to_vec()).collect();
        let mut adaptive = false;

        loop {
            let mut failed: Vec<(Vec<Observation>, SyncError)> = Vec::new();

            for chunk in pending {
                match self.write_chunk(series_id, &chunk, cancel).await {
                    Ok(result) => outcome.absorb(result),
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        debug!(
                            series_id,
                            rows = chunk.len(),
                            "Chunk write failed: {}",
                            err
                        );
                        failed.push((chunk, err));
                    }
                }
            }

            if failed.is_empty() {
                break;
            }

            let failed_rows: usize = failed.iter().map(|(c, _)| c.len()).sum();
            let error_rate = failed_rows as f64 / total as f64;

            if (!adaptive && error_rate <= self.error_rate_threshold) || chunk_size <= 1 {
                record_failures(&mut outcome, failed);
                break;
            }
            adaptive = true;

            let next_size = if chunk_size > self.min_chunk_size {
                (chunk_size / 2).max(self.min_chunk_size)
            } else {
                1
            };

            warn!(
                series_id,
                failed_rows,
                error_rate = format!("{:.3}", error_rate),
                chunk_size = next_size,
                "Write error rate above threshold, retrying failed rows in smaller chunks"
            );

            let retry_rows: Vec<Observation> =
                failed.into_iter().flat_map(|(chunk, _)| chunk).collect();
            pending = retry_rows
                .chunks(next_size)
                .map(|c| c.to_vec())
                .collect();
            chunk_size = next_size;
        }

        outcome.written_through = written_prefix_end(&rows, &outcome.errors);

        info!(
            "Upserted {} for {}: {} inserted, {} updated, {} unchanged, {} skipped, {} failed",
            total,
            series_id,
            outcome.inserted,
            outcome.updated,
            outcome.unchanged,
            outcome.skipped,
            outcome.failed_rows()
        );
        Ok(outcome)
    }

    async fn write_chunk(
        &self,
        series_id: &str,
        rows: &[Observation],
        cancel: &CancellationToken,
    ) -> Result<ChunkOutcome> {
        let label = match (rows.first(), rows.last()) {
            (Some(first), Some(last)) => {
                format!("write {} [{}..{}]", series_id, first.date, last.date)
            }
            _ => format!("write {}", series_id),
        };

        self.retry
            .run(&label, cancel, |_attempt| {
                let store = Arc::clone(&self.store);
                let permits = Arc::clone(&self.permits);
                let series_id = series_id.to_string();
                let rows = rows.to_vec();

                async move {
                    let _permit = tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(SyncError::Cancelled("write cancelled".into()));
                        }
                        permit = permits.acquire_owned() => permit
                            .map_err(|_| SyncError::Internal("write semaphore closed".into()))?,
                    };

                    // Once started a chunk runs to completion, cancelled or not
                    tokio::task::spawn_blocking(move || store.upsert_chunk(&series_id, &rows))
                        .await
                        .map_err(|e| SyncError::Internal(format!("write task failed: {}", e)))?
                }
            })
            .await
    }
}

/// Newest row date strictly before the earliest failed row
fn written_prefix_end(rows: &[Observation], errors: &[WriteFailure]) -> Option<NaiveDate> {
    match errors.iter().map(|e| e.first_date).min() {
        Some(first_failed) => rows
            .iter()
            .map(|o| o.date)
            .take_while(|d| *d < first_failed)
            .last(),
        None => rows.last().map(|o| o.date),
    }
}

fn record_failures(outcome: &mut UpsertOutcome, failed: Vec<(Vec<Observation>, SyncError)>) {
    for (chunk, err) in failed {
        let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
            continue;
        };
        outcome.errors.push(WriteFailure {
            first_date: first.date,
            last_date: last.date,
            rows: chunk.len(),
            message: err.to_string(),
        });
    }
}
