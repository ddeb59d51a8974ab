//! SQLite database module
//!
//! Operational state: checkpoints, the series registry and run history.
//! Each concern is a submodule of free functions over a `&Connection`;
//! [`SqliteDb`] checks a connection out of the pool and delegates.

mod checkpoints;
mod migrations;
mod runs;
mod series;

use crate::error::{Result, SyncError};
use crate::sync::checkpoint::{Checkpoint, CheckpointStore};
use crate::sync::status::RunReport;
use crate::types::SeriesSpec;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

pub type SqlitePool = r2d2::Pool<SqliteConnectionManager>;

/// SQLite database wrapper
pub struct SqliteDb {
    pool: SqlitePool,
}

impl SqliteDb {
    /// Open (or create) the database file behind a pool of `pool_size`
    /// connections and run migrations
    pub fn new(path: &Path, pool_size: u32) -> Result<Self> {
        // WAL lets readers proceed while a checkpoint save is in flight
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
            )
        });
        let pool = r2d2::Pool::builder().max_size(pool_size).build(manager)?;

        let db = Self { pool };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        migrations::run_migrations(&conn)
    }

    // ========== Series Registry ==========

    /// Insert or replace a registered series
    pub fn upsert_series(&self, spec: &SeriesSpec) -> Result<()> {
        let conn = self.conn()?;
        series::upsert_series(&conn, spec)
    }

    pub fn list_series(&self) -> Result<Vec<SeriesSpec>> {
        let conn = self.conn()?;
        series::list_series(&conn)
    }

    pub fn get_series(&self, series_id: &str) -> Result<Option<SeriesSpec>> {
        let conn = self.conn()?;
        series::get_series(&conn, series_id)
    }

    // ========== Run History ==========

    /// Persist a finished (or failed-to-start) run
    pub fn save_report(&self, report: &RunReport) -> Result<()> {
        let conn = self.conn()?;
        runs::save_report(&conn, report)
    }

    pub fn latest_report(&self) -> Result<Option<RunReport>> {
        let conn = self.conn()?;
        runs::latest_report(&conn)
    }

    /// Newest first
    pub fn recent_reports(&self, limit: usize) -> Result<Vec<RunReport>> {
        let conn = self.conn()?;
        runs::recent_reports(&conn, limit)
    }
}

impl CheckpointStore for SqliteDb {
    fn load(&self, series_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn()?;
        checkpoints::load_checkpoint(&conn, series_id)
    }

    fn save(&self, series_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let conn = self.conn()?;
        checkpoints::save_checkpoint(&conn, series_id, checkpoint)
    }

    fn list(&self) -> Result<Vec<Checkpoint>> {
        let conn = self.conn()?;
        checkpoints::list_checkpoints(&conn)
    }

    fn prune_stale(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        checkpoints::prune_completed(&conn, cutoff)
    }
}

/// Fixed-width UTC timestamps so text comparison matches time order
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::store(format!("unreadable timestamp {}: {}", text, e), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::checkpoint::CheckpointStatus;
    use crate::sync::orchestrator::SyncModeKind;
    use crate::sync::status::RunPhase;
    use crate::types::{parse_date, Frequency, Priority};
    use chrono::Duration;

    fn open() -> (tempfile::TempDir, SqliteDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteDb::new(&dir.path().join("state.db"), 2).unwrap();
        (dir, db)
    }

    #[test]
    fn test_checkpoint_save_replaces() {
        let (_dir, db) = open();
        assert!(db.load("DGS10").unwrap().is_none());

        let mut cp = Checkpoint::start("DGS10", "run-1", 100);
        db.save("DGS10", &cp).unwrap();

        cp.advance(parse_date("2024-03-01").unwrap(), 60);
        cp.last_observation_date = parse_date("2024-03-05");
        db.save("DGS10", &cp).unwrap();

        let loaded = db.load("DGS10").unwrap().unwrap();
        assert_eq!(loaded.last_synced_date, parse_date("2024-03-01"));
        assert_eq!(loaded.last_observation_date, parse_date("2024-03-05"));
        assert_eq!(loaded.processed_count, 60);
        assert_eq!(loaded.status, CheckpointStatus::Active);
        assert_eq!(db.list().unwrap().len(), 1);
    }

    #[test]
    fn test_prune_only_completed() {
        let (_dir, db) = open();
        let old = Utc::now() - Duration::hours(72);

        for (id, status) in [
            ("A", CheckpointStatus::Completed),
            ("B", CheckpointStatus::Failed),
            ("C", CheckpointStatus::Paused),
        ] {
            let mut cp = Checkpoint::start(id, "run-1", 0);
            cp.status = status;
            cp.updated_at = old;
            db.save(id, &cp).unwrap();
        }
        let mut fresh = Checkpoint::start("D", "run-2", 0);
        fresh.finish(CheckpointStatus::Completed);
        db.save("D", &fresh).unwrap();

        // Completed but still held below a failed write
        let mut held = Checkpoint::start("E", "run-1", 0);
        held.hold(None, parse_date("2024-03-05").unwrap());
        held.finish(CheckpointStatus::Completed);
        held.updated_at = old;
        db.save("E", &held).unwrap();

        let removed = db.prune_stale(Utc::now() - Duration::hours(24)).unwrap();
        assert_eq!(removed, 1);
        let left: Vec<String> = db.list().unwrap().into_iter().map(|c| c.series_id).collect();
        assert_eq!(left, vec!["B", "C", "D", "E"]);
        let loaded = db.load("E").unwrap().unwrap();
        assert!(loaded.held);
        assert_eq!(loaded.last_synced_date, parse_date("2024-03-04"));
    }

    #[test]
    fn test_series_registry() {
        let (_dir, db) = open();
        let spec = SeriesSpec::new("T10Y2Y", Frequency::Daily)
            .with_priority(Priority::High)
            .allowing_negative();
        db.upsert_series(&spec).unwrap();
        db.upsert_series(&SeriesSpec::new("GDP", Frequency::Quarterly)).unwrap();

        let mut updated = spec.clone();
        updated.title = "10Y minus 2Y".into();
        updated.lookback_years = Some(30);
        db.upsert_series(&updated).unwrap();

        let all = db.list_series().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(db.get_series("T10Y2Y").unwrap(), Some(updated));
        assert!(db.get_series("NOPE").unwrap().is_none());
    }

    #[test]
    fn test_run_history() {
        let (_dir, db) = open();
        assert!(db.latest_report().unwrap().is_none());

        let mut first = RunReport::new("run-1", SyncModeKind::Full, 0);
        first.finish(RunPhase::Completed);
        db.save_report(&first).unwrap();

        let mut second = RunReport::new("run-2", SyncModeKind::Incremental, 0);
        second.started_at = first.started_at + Duration::seconds(5);
        second.finish(RunPhase::Completed);
        db.save_report(&second).unwrap();

        assert_eq!(db.latest_report().unwrap().unwrap().run_id, "run-2");
        let recent = db.recent_reports(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].run_id, "run-1");
        assert_eq!(db.recent_reports(1).unwrap().len(), 1);
    }
}
