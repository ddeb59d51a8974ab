//! In-memory stores
//!
//! Back `--dry-run` and the test suite. The observation store enforces the
//! same row rules as the DuckDB table (value present and finite) and applies
//! each chunk atomically.

use crate::error::{Result, SyncError};
use crate::sync::checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore};
use crate::sync::writer::{ChunkOutcome, ObservationStore};
use crate::types::Observation;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

type RowConstraint = Box<dyn Fn(&Observation) -> bool + Send + Sync>;

#[derive(Default)]
pub struct MemoryObservationStore {
    series: DashMap<String, BTreeMap<NaiveDate, f64>>,
    constraint: Option<RowConstraint>,
    transient_failures: AtomicUsize,
}

impl MemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject rows failing `check` in addition to the built-in rules
    pub fn with_constraint<F>(mut self, check: F) -> Self
    where
        F: Fn(&Observation) -> bool + Send + Sync + 'static,
    {
        self.constraint = Some(Box::new(check));
        self
    }

    /// Fail the next `n` chunk writes with a transient store error
    pub fn inject_transient_failures(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    fn check_row(&self, row: &Observation) -> Result<f64> {
        let value = match row.value {
            Some(v) if v.is_finite() => v,
            other => {
                return Err(SyncError::store(
                    format!(
                        "constraint violation for {} on {}: value {:?}",
                        row.series_id, row.date, other
                    ),
                    false,
                ))
            }
        };
        if let Some(check) = &self.constraint {
            if !check(row) {
                return Err(SyncError::store(
                    format!("constraint violation for {} on {}", row.series_id, row.date),
                    false,
                ));
            }
        }
        Ok(value)
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn in_range(date: NaiveDate, start: Option<NaiveDate>, end: Option<NaiveDate>) -> bool {
    start.map_or(true, |s| date >= s) && end.map_or(true, |e| date <= e)
}

impl ObservationStore for MemoryObservationStore {
    fn upsert_chunk(&self, series_id: &str, rows: &[Observation]) -> Result<ChunkOutcome> {
        if self.take_transient_failure() {
            return Err(SyncError::store("injected transient failure", true));
        }

        // Validate the whole chunk first so it applies all-or-nothing
        let values = rows
            .iter()
            .map(|row| self.check_row(row).map(|v| (row.date, v)))
            .collect::<Result<Vec<_>>>()?;

        let mut stored = self.series.entry(series_id.to_string()).or_default();
        let mut outcome = ChunkOutcome::default();
        for (date, value) in values {
            match stored.insert(date, value) {
                None => outcome.inserted += 1,
                Some(prev) if prev == value => outcome.unchanged += 1,
                Some(_) => outcome.updated += 1,
            }
        }
        Ok(outcome)
    }

    fn query_range(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<Observation>> {
        Ok(self
            .series
            .get(series_id)
            .map(|rows| {
                rows.iter()
                    .filter(|(d, _)| in_range(**d, start, end))
                    .map(|(d, v)| Observation::new(series_id, *d, *v))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn existing_dates(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<NaiveDate>> {
        Ok(self
            .series
            .get(series_id)
            .map(|rows| {
                rows.keys()
                    .filter(|d| in_range(**d, start, end))
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn latest_date(&self, series_id: &str) -> Result<Option<NaiveDate>> {
        Ok(self
            .series
            .get(series_id)
            .and_then(|rows| rows.keys().next_back().copied()))
    }

    fn earliest_date(&self, series_id: &str) -> Result<Option<NaiveDate>> {
        Ok(self
            .series
            .get(series_id)
            .and_then(|rows| rows.keys().next().copied()))
    }

    fn count(&self, series_id: &str) -> Result<usize> {
        Ok(self.series.get(series_id).map(|rows| rows.len()).unwrap_or(0))
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<String, Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, series_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.get(series_id).map(|c| c.value().clone()))
    }

    fn save(&self, series_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .insert(series_id.to_string(), checkpoint.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut all: Vec<Checkpoint> = self.checkpoints.iter().map(|c| c.value().clone()).collect();
        all.sort_by(|a, b| a.series_id.cmp(&b.series_id));
        Ok(all)
    }

    fn prune_stale(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.checkpoints.len();
        self.checkpoints.retain(|_, cp| {
            !(cp.status == CheckpointStatus::Completed && !cp.held && cp.updated_at < cutoff)
        });
        Ok(before - self.checkpoints.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_date;
    use chrono::Duration;

    fn obs(date: &str, value: f64) -> Observation {
        Observation::new("X", parse_date(date).unwrap(), value)
    }

    #[test]
    fn test_chunk_is_all_or_nothing() {
        let store = MemoryObservationStore::new();
        let err = store
            .upsert_chunk("X", &[obs("2024-01-01", 1.0), obs("2024-01-02", f64::NAN)])
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(store.count("X").unwrap(), 0);
    }

    #[test]
    fn test_custom_constraint() {
        let store = MemoryObservationStore::new().with_constraint(|o| o.value < Some(100.0));
        assert!(store.upsert_chunk("X", &[obs("2024-01-01", 1.0)]).is_ok());
        assert!(store.upsert_chunk("X", &[obs("2024-01-02", 500.0)]).is_err());
    }

    #[test]
    fn test_range_queries() {
        let store = MemoryObservationStore::new();
        store
            .upsert_chunk(
                "X",
                &[obs("2024-01-01", 1.0), obs("2024-01-05", 2.0), obs("2024-01-09", 3.0)],
            )
            .unwrap();

        let mid = store
            .existing_dates("X", parse_date("2024-01-02"), parse_date("2024-01-09"))
            .unwrap();
        assert_eq!(mid.len(), 2);
        assert_eq!(store.latest_date("X").unwrap(), parse_date("2024-01-09"));
        assert_eq!(store.earliest_date("X").unwrap(), parse_date("2024-01-01"));
        assert!(store.latest_date("Y").unwrap().is_none());
    }

    #[test]
    fn test_prune_keeps_resumable() {
        let store = MemoryCheckpointStore::new();
        let old = Utc::now() - Duration::hours(48);

        let mut done = Checkpoint::start("A", "r", 0);
        done.finish(CheckpointStatus::Completed);
        done.updated_at = old;
        let mut paused = Checkpoint::start("B", "r", 0);
        paused.finish(CheckpointStatus::Paused);
        paused.updated_at = old;

        let mut held = Checkpoint::start("C", "r", 0);
        held.hold(None, parse_date("2024-03-05").unwrap());
        held.finish(CheckpointStatus::Completed);
        held.updated_at = old;

        store.save("A", &done).unwrap();
        store.save("B", &paused).unwrap();
        store.save("C", &held).unwrap();

        let removed = store.prune_stale(Utc::now() - Duration::hours(24)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.load("A").unwrap().is_none());
        assert!(store.load("B").unwrap().is_some());
        assert!(store.load("C").unwrap().is_some());
    }
}
