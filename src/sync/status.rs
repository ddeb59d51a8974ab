//! Run status reporting
//!
//! Per-series [`SyncResult`]s roll up into a [`RunReport`] that consumers
//! poll as JSON. The [`StatusBoard`] holds the in-flight report while a run
//! executes.

use crate::sync::orchestrator::SyncModeKind;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Pending,
    Running,
    Completing,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Pending => "pending",
            RunPhase::Running => "running",
            RunPhase::Completing => "completing",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }
}

/// How one series ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesOutcome {
    Succeeded,
    Failed,
    Paused,
}

/// How the run as a whole ended, as the caller sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    AllSucceeded,
    PartialFailure,
    NotStarted,
}

impl RunOutcome {
    /// Process exit code for CLI callers
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::AllSucceeded => 0,
            RunOutcome::NotStarted => 1,
            RunOutcome::PartialFailure => 2,
        }
    }
}

/// Outcome of one series in one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub series_id: String,
    pub mode: SyncModeKind,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub gaps_detected: usize,
    pub gaps_filled: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub outcome: SeriesOutcome,
}

impl SyncResult {
    pub fn new(series_id: impl Into<String>, mode: SyncModeKind) -> Self {
        Self {
            series_id: series_id.into(),
            mode,
            fetched: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            gaps_detected: 0,
            gaps_filled: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
            outcome: SeriesOutcome::Succeeded,
        }
    }

    pub fn failed(&self) -> bool {
        self.outcome != SeriesOutcome::Succeeded
    }

    /// Rows this series moved through the pipeline
    pub fn records(&self) -> usize {
        self.fetched
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub mode: SyncModeKind,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Tier currently (or last) processed
    pub current_tier: Option<String>,
    pub total_series: usize,
    pub processed_series: usize,
    pub failed_series: usize,
    /// Records the run expects to move: finished series count what they
    /// fetched, pending ones their last known size
    pub total_records: usize,
    pub processed_records: usize,
    /// 0.0 ..= 1.0
    pub progress: f64,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub results: Vec<SyncResult>,
    /// Initialization error when the run could not start
    pub error: Option<String>,
    #[serde(skip)]
    expected_records: HashMap<String, usize>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, mode: SyncModeKind, total_series: usize) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            phase: RunPhase::Pending,
            started_at: Utc::now(),
            finished_at: None,
            current_tier: None,
            total_series,
            processed_series: 0,
            failed_series: 0,
            total_records: 0,
            processed_records: 0,
            progress: 0.0,
            estimated_completion: None,
            results: Vec::new(),
            error: None,
            expected_records: HashMap::new(),
        }
    }

    /// Seed the record estimate for a series that has not finished yet
    pub fn expect_records(&mut self, series_id: &str, records: usize) {
        self.expected_records.insert(series_id.to_string(), records);
        self.recount();
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.phase == RunPhase::Failed {
            RunOutcome::NotStarted
        } else if self.results.iter().any(SyncResult::failed) {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::AllSucceeded
        }
    }

    /// Replace any earlier result for the same series (auto-recovery retries)
    pub fn record(&mut self, result: SyncResult) {
        match self
            .results
            .iter_mut()
            .find(|r| r.series_id == result.series_id)
        {
            Some(existing) => *existing = result,
            None => self.results.push(result),
        }
        self.recount();
    }

    fn recount(&mut self) {
        self.processed_series = self.results.len();
        self.failed_series = self.results.iter().filter(|r| r.failed()).count();
        self.processed_records = self.results.iter().map(SyncResult::records).sum();

        let finished: HashSet<&str> = self.results.iter().map(|r| r.series_id.as_str()).collect();
        let pending: Vec<usize> = self
            .expected_records
            .iter()
            .filter(|(id, _)| !finished.contains(id.as_str()))
            .map(|(_, n)| *n)
            .collect();
        let pending_known: usize = pending.iter().sum();

        // Series with no estimate are assumed to be of average size
        let samples = self.results.len() + pending.len();
        let average = match samples {
            0 => 0,
            n => (self.processed_records + pending_known) / n,
        };
        let unknown = self.total_series.saturating_sub(samples);

        self.total_records = self.processed_records + pending_known + unknown * average;
    }

    /// Update progress and extrapolate completion from throughput so far
    pub fn update_progress(&mut self, elapsed_secs: f64) {
        self.progress = if self.total_records > 0 {
            (self.processed_records as f64 / self.total_records as f64).min(1.0)
        } else if self.total_series > 0 {
            (self.processed_series as f64 / self.total_series as f64).min(1.0)
        } else {
            1.0
        };

        self.estimated_completion = if self.progress > 0.0 && self.progress < 1.0 {
            let remaining = elapsed_secs * (1.0 - self.progress) / self.progress;
            chrono::Duration::try_milliseconds((remaining * 1000.0) as i64)
                .map(|d| Utc::now() + d)
        } else {
            None
        };
    }

    pub fn finish(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.finished_at = Some(Utc::now());
        if phase == RunPhase::Completed {
            self.progress = 1.0;
            self.estimated_completion = None;
        }
    }
}

/// Live view of the run in progress, shared with the HTTP surface
#[derive(Default)]
pub struct StatusBoard {
    current: RwLock<Option<RunReport>>,
    started: RwLock<Option<Instant>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the first report of a run and restart the clock ETA
    /// estimates are measured from; later updates go through `publish`
    pub fn begin(&self, report: &RunReport) {
        *self.started.write() = Some(Instant::now());
        *self.current.write() = Some(report.clone());
    }

    pub fn publish(&self, report: &RunReport) {
        *self.current.write() = Some(report.clone());
    }

    /// Snapshot of the latest published report
    pub fn snapshot(&self) -> Option<RunReport> {
        self.current.read().clone()
    }

    /// Report of a run that has not reached a terminal phase
    pub fn active(&self) -> Option<RunReport> {
        self.current
            .read()
            .as_ref()
            .filter(|r| !r.phase.is_terminal())
            .cloned()
    }

    pub fn is_running(&self) -> bool {
        self.active().is_some()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started
            .read()
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, outcome: SeriesOutcome, fetched: usize) -> SyncResult {
        let mut r = SyncResult::new(id, SyncModeKind::Full);
        r.outcome = outcome;
        r.fetched = fetched;
        r
    }

    #[test]
    fn test_outcome_classification() {
        let mut report = RunReport::new("run-1", SyncModeKind::Full, 2);
        report.record(result("A", SeriesOutcome::Succeeded, 10));
        report.record(result("B", SeriesOutcome::Succeeded, 10));
        assert_eq!(report.outcome(), RunOutcome::AllSucceeded);

        report.record(result("B", SeriesOutcome::Failed, 0));
        assert_eq!(report.outcome(), RunOutcome::PartialFailure);
        assert_eq!(report.outcome().exit_code(), 2);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.failed_series, 1);

        report.finish(RunPhase::Failed);
        assert_eq!(report.outcome(), RunOutcome::NotStarted);
    }

    #[test]
    fn test_progress_and_eta() {
        let mut report = RunReport::new("run-1", SyncModeKind::Incremental, 4);
        report.record(result("A", SeriesOutcome::Succeeded, 100));
        report.update_progress(10.0);
        assert_eq!(report.progress, 0.25);
        assert!(report.estimated_completion.is_some());
        assert_eq!(report.processed_records, 100);

        report.finish(RunPhase::Completed);
        assert_eq!(report.progress, 1.0);
        assert!(report.estimated_completion.is_none());
    }

    #[test]
    fn test_progress_follows_records_not_series() {
        let mut report = RunReport::new("run-1", SyncModeKind::Full, 3);
        report.expect_records("SMALL", 100);
        report.expect_records("LARGE", 900);

        report.record(result("SMALL", SeriesOutcome::Succeeded, 100));
        report.update_progress(5.0);
        // One series in three, but only 100 of ~1500 records
        assert_eq!(report.processed_series, 1);
        assert_eq!(report.total_records, 1500);
        assert!(report.progress < 0.1, "{}", report.progress);
        assert!(report.estimated_completion.is_some());

        report.record(result("LARGE", SeriesOutcome::Succeeded, 900));
        report.update_progress(50.0);
        assert!((report.progress - 1000.0 / 1500.0).abs() < 1e-9);

        report.record(result("OTHER", SeriesOutcome::Succeeded, 50));
        report.update_progress(55.0);
        assert_eq!(report.total_records, 1050);
        assert_eq!(report.progress, 1.0);
        assert!(report.estimated_completion.is_none());
    }

    #[test]
    fn test_board_tracks_active_run() {
        let board = StatusBoard::new();
        let mut report = RunReport::new("run-1", SyncModeKind::Full, 1);
        report.phase = RunPhase::Running;
        board.begin(&report);
        assert!(board.is_running());

        report.finish(RunPhase::Completed);
        board.publish(&report);
        assert!(!board.is_running());
        assert_eq!(board.snapshot().map(|r| r.phase), Some(RunPhase::Completed));
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = RunReport::new("run-1", SyncModeKind::Backfill, 0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["runId"], "run-1");
        assert_eq!(json["mode"], "backfill");
        assert_eq!(json["phase"], "pending");
    }
}
