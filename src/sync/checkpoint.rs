//! Per-series sync checkpoints
//!
//! One checkpoint per series, superseded on every completed batch. The
//! orchestrator reads it to decide where a recovery run resumes; only the
//! housekeeping pass ever deletes one.

use crate::error::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Active,
    Completed,
    Failed,
    Paused,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Active => "active",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::Paused => "paused",
        }
    }

    /// Whether a run that ended in this status left work for recovery.
    /// See [`Checkpoint::is_resumable`] for the check that also survives
    /// later runs.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, CheckpointStatus::Completed)
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(CheckpointStatus::Active),
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            "paused" => Ok(CheckpointStatus::Paused),
            other => Err(format!("unknown checkpoint status: {}", other)),
        }
    }
}

/// Durable sync progress for one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub series_id: String,
    pub run_id: String,
    /// Newest date whose batch is known to be written
    pub last_synced_date: Option<NaiveDate>,
    /// Newest observation date seen upstream in this run
    pub last_observation_date: Option<NaiveDate>,
    /// Rows the run expects to write
    pub total_count: u64,
    /// Rows written so far
    pub processed_count: u64,
    pub status: CheckpointStatus,
    /// Set by a failed write: `last_synced_date` is pinned below rows that
    /// are not stored. Carried into later runs until a clean window starting
    /// at or before the day after the pin rewrites that range.
    #[serde(default)]
    pub held: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Fresh checkpoint for a run that has not written anything yet
    pub fn start(series_id: impl Into<String>, run_id: impl Into<String>, total_count: u64) -> Self {
        let now = Utc::now();
        Self {
            series_id: series_id.into(),
            run_id: run_id.into(),
            last_synced_date: None,
            last_observation_date: None,
            total_count,
            processed_count: 0,
            status: CheckpointStatus::Active,
            held: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Carry a previous checkpoint into a new run, keeping its creation
    /// time, resume point and hold
    pub fn continue_from(previous: &Checkpoint, run_id: impl Into<String>, total_count: u64) -> Self {
        let mut next = Self::start(previous.series_id.clone(), run_id, total_count);
        next.created_at = previous.created_at;
        next.last_synced_date = previous.last_synced_date;
        next.held = previous.held;
        next
    }

    /// Whether recovery has work to do: the last run did not complete, or
    /// an earlier failed write is still held. A hold keeps the checkpoint
    /// resumable across later runs until its pinned range is rewritten.
    pub fn is_resumable(&self) -> bool {
        self.held || self.status.is_resumable()
    }

    /// Record a written batch ending at `through`. A held checkpoint counts
    /// the rows but keeps its resume point.
    pub fn advance(&mut self, through: NaiveDate, rows: u64) {
        if !self.held {
            self.last_synced_date = Some(match self.last_synced_date {
                Some(prev) => prev.max(through),
                None => through,
            });
        }
        self.processed_count += rows;
        self.updated_at = Utc::now();
    }

    /// Pin the resume point below a failed write and mark the checkpoint
    /// failed. `written_through` is the newest stored date before the first
    /// failed row; without one the day before `first_failed` is used. The
    /// pin may drop below a date carried over from an earlier run, and a
    /// second hold only ever lowers it.
    pub fn hold(&mut self, written_through: Option<NaiveDate>, first_failed: NaiveDate) {
        let pin = written_through
            .filter(|d| *d < first_failed)
            .or_else(|| first_failed.pred_opt())
            .unwrap_or(first_failed);
        self.last_synced_date = Some(match (self.held, self.last_synced_date) {
            (true, Some(prev)) => prev.min(pin),
            _ => pin,
        });
        self.held = true;
        self.status = CheckpointStatus::Failed;
        self.updated_at = Utc::now();
    }

    /// Lift the hold once every row from `covered_from` onward has been
    /// written cleanly and that range reaches back over the pin. Returns
    /// whether the hold was lifted.
    pub fn release(&mut self, covered_from: NaiveDate) -> bool {
        let reaches_pin = match self.last_synced_date {
            Some(pin) => pin.succ_opt().map_or(true, |next| covered_from <= next),
            None => true,
        };
        if self.held && reaches_pin {
            self.held = false;
            self.updated_at = Utc::now();
            return true;
        }
        false
    }

    pub fn finish(&mut self, status: CheckpointStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Fetch start for a resumed run: the last synced date minus the overlap,
    /// so the boundary day is re-read rather than skipped
    pub fn resume_date(&self, overlap_days: i64) -> Option<NaiveDate> {
        self.last_synced_date
            .map(|d| d - Duration::days(overlap_days.max(0)))
    }

    pub fn progress(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        (self.processed_count as f64 / self.total_count as f64).min(1.0)
    }
}

/// Durable checkpoint storage.
///
/// `save` must be atomic: a checkpoint either lands whole or not at all.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, series_id: &str) -> Result<Option<Checkpoint>>;

    fn save(&self, series_id: &str, checkpoint: &Checkpoint) -> Result<()>;

    fn list(&self) -> Result<Vec<Checkpoint>>;

    /// Delete completed checkpoints last updated before `cutoff`.
    /// Returns how many were removed.
    fn prune_stale(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_date;

    #[test]
    fn test_advance_is_monotonic() {
        let mut cp = Checkpoint::start("DGS10", "run-1", 100);
        cp.advance(parse_date("2024-03-01").unwrap(), 40);
        cp.advance(parse_date("2024-02-01").unwrap(), 10);

        assert_eq!(cp.last_synced_date, parse_date("2024-03-01"));
        assert_eq!(cp.processed_count, 50);
        assert_eq!(cp.progress(), 0.5);
    }

    #[test]
    fn test_hold_pins_below_carried_date() {
        let mut done = Checkpoint::start("DGS10", "run-1", 10);
        done.advance(parse_date("2024-06-30").unwrap(), 10);
        done.finish(CheckpointStatus::Completed);

        let mut cp = Checkpoint::continue_from(&done, "run-2", 100);
        cp.hold(parse_date("2024-03-04"), parse_date("2024-03-05").unwrap());
        assert_eq!(cp.status, CheckpointStatus::Failed);
        assert!(cp.held);
        assert_eq!(cp.last_synced_date, parse_date("2024-03-04"));

        // Later clean batches count rows but never move the pin up
        cp.advance(parse_date("2024-06-30").unwrap(), 20);
        assert_eq!(cp.last_synced_date, parse_date("2024-03-04"));
        assert_eq!(cp.processed_count, 20);

        // A failure further back lowers it; nothing written falls back to
        // the day before the failed row
        cp.hold(None, parse_date("2024-01-10").unwrap());
        assert_eq!(cp.last_synced_date, parse_date("2024-01-09"));
        cp.hold(parse_date("2024-05-01"), parse_date("2024-05-02").unwrap());
        assert_eq!(cp.last_synced_date, parse_date("2024-01-09"));
    }

    #[test]
    fn test_hold_survives_later_runs_until_released() {
        let mut failed = Checkpoint::start("DGS10", "run-1", 100);
        failed.hold(parse_date("2024-03-04"), parse_date("2024-03-05").unwrap());
        failed.finish(CheckpointStatus::Failed);

        // A clean run that ends completed still leaves the hold in place
        let mut next = Checkpoint::continue_from(&failed, "run-2", 10);
        assert!(next.held);
        next.advance(parse_date("2024-06-30").unwrap(), 10);
        next.finish(CheckpointStatus::Completed);
        assert_eq!(next.last_synced_date, parse_date("2024-03-04"));
        assert!(next.is_resumable());

        // Only a range that starts at or before the day after the pin lifts it
        let mut resumed = Checkpoint::continue_from(&next, "run-3", 10);
        assert!(!resumed.release(parse_date("2024-03-06").unwrap()));
        assert!(resumed.release(parse_date("2024-03-05").unwrap()));
        resumed.advance(parse_date("2024-06-30").unwrap(), 10);
        resumed.finish(CheckpointStatus::Completed);
        assert_eq!(resumed.last_synced_date, parse_date("2024-06-30"));
        assert!(!resumed.is_resumable());
    }

    #[test]
    fn test_resume_date_overlaps() {
        let mut cp = Checkpoint::start("DGS10", "run-1", 0);
        assert_eq!(cp.resume_date(1), None);

        cp.advance(parse_date("2024-03-10").unwrap(), 1);
        assert_eq!(cp.resume_date(1), parse_date("2024-03-09"));
        assert_eq!(cp.resume_date(-3), parse_date("2024-03-10"));
    }

    #[test]
    fn test_continue_keeps_history() {
        let mut first = Checkpoint::start("DGS10", "run-1", 10);
        first.advance(parse_date("2024-03-10").unwrap(), 10);
        first.finish(CheckpointStatus::Paused);

        let next = Checkpoint::continue_from(&first, "run-2", 5);
        assert_eq!(next.created_at, first.created_at);
        assert_eq!(next.last_synced_date, first.last_synced_date);
        assert_eq!(next.status, CheckpointStatus::Active);
        assert!(!next.held);
        assert_eq!(next.processed_count, 0);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            CheckpointStatus::Active,
            CheckpointStatus::Completed,
            CheckpointStatus::Failed,
            CheckpointStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<CheckpointStatus>(), Ok(status));
        }
        assert!(!CheckpointStatus::Completed.is_resumable());
        assert!(CheckpointStatus::Paused.is_resumable());
    }
}
