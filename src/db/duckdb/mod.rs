//! DuckDB observation store
//!
//! Columnar home of the time series. One row per `(series_id, date)` with
//! dates stored as `YYYY-MM-DD` text, so text order is date order. The
//! table rejects missing and non-finite values.

mod migrations;

use crate::error::{Result, SyncError};
use crate::sync::writer::{ChunkOutcome, ObservationStore};
use crate::types::{format_date, parse_date, Observation};
use chrono::NaiveDate;
use duckdb::Connection;
use parking_lot::Mutex;
use std::path::Path;

/// DuckDB database wrapper
pub struct DuckDb {
    conn: Mutex<Connection>,
}

impl DuckDb {
    /// Open (or create) the database file and run migrations
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Throwaway in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();
        migrations::run_migrations(&conn)
    }

    fn query_dates(&self, sql: &str, series_id: &str) -> Result<Option<NaiveDate>> {
        let conn = self.conn.lock();
        let date: Option<String> = conn.query_row(sql, [series_id], |row| row.get(0))?;
        date.map(|d| stored_date(&d)).transpose()
    }
}

fn stored_date(text: &str) -> Result<NaiveDate> {
    parse_date(text).ok_or_else(|| SyncError::store(format!("unreadable stored date: {}", text), false))
}

fn bound(date: Option<NaiveDate>) -> Option<String> {
    date.map(format_date)
}

impl ObservationStore for DuckDb {
    fn upsert_chunk(&self, series_id: &str, rows: &[Observation]) -> Result<ChunkOutcome> {
        // Reject the chunk up front rather than half-way through the transaction
        for row in rows {
            if !row.value.map_or(false, f64::is_finite) {
                return Err(SyncError::store(
                    format!(
                        "constraint violation for {} on {}: value {:?}",
                        series_id, row.date, row.value
                    ),
                    false,
                ));
            }
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut existing =
            tx.prepare("SELECT value FROM observations WHERE series_id = ? AND date = ?")?;
        let mut upsert = tx.prepare(
            "INSERT INTO observations (series_id, date, value, fetched_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT (series_id, date) DO UPDATE SET
               value = excluded.value, fetched_at = excluded.fetched_at",
        )?;

        let mut outcome = ChunkOutcome::default();
        for row in rows {
            let date = format_date(row.date);
            let previous: Option<f64> = {
                let mut found = existing.query(duckdb::params![series_id, date])?;
                match found.next()? {
                    Some(r) => Some(r.get(0)?),
                    None => None,
                }
            };

            upsert.execute(duckdb::params![series_id, date, row.value])?;
            match previous {
                None => outcome.inserted += 1,
                Some(prev) if Some(prev) == row.value => outcome.unchanged += 1,
                Some(_) => outcome.updated += 1,
            }
        }

        drop(existing);
        drop(upsert);
        tx.commit()?;

        Ok(outcome)
    }

    fn query_range(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<Observation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT date, value
             FROM observations
             WHERE series_id = ?
               AND (CAST(? AS VARCHAR) IS NULL OR date >= ?)
               AND (CAST(? AS VARCHAR) IS NULL OR date <= ?)
             ORDER BY date ASC",
        )?;

        let (start, end) = (bound(start), bound(end));
        let rows = stmt
            .query_map(
                duckdb::params![series_id, start, start, end, end],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(date, value)| Ok(Observation::new(series_id, stored_date(&date)?, value)))
            .collect()
    }

    fn existing_dates(
        &self,
        series_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<NaiveDate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT date
             FROM observations
             WHERE series_id = ?
               AND (CAST(? AS VARCHAR) IS NULL OR date >= ?)
               AND (CAST(? AS VARCHAR) IS NULL OR date <= ?)
             ORDER BY date ASC",
        )?;

        let (start, end) = (bound(start), bound(end));
        let dates = stmt
            .query_map(duckdb::params![series_id, start, start, end, end], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        dates.iter().map(|d| stored_date(d)).collect()
    }

    fn latest_date(&self, series_id: &str) -> Result<Option<NaiveDate>> {
        self.query_dates(
            "SELECT MAX(date) FROM observations WHERE series_id = ?",
            series_id,
        )
    }

    fn earliest_date(&self, series_id: &str) -> Result<Option<NaiveDate>> {
        self.query_dates(
            "SELECT MIN(date) FROM observations WHERE series_id = ?",
            series_id,
        )
    }

    fn count(&self, series_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM observations WHERE series_id = ?",
            [series_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
