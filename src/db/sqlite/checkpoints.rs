//! Checkpoint persistence

use super::{parse_timestamp, timestamp};
use crate::error::{Result, SyncError};
use crate::sync::checkpoint::{Checkpoint, CheckpointStatus};
use crate::types::{format_date, parse_date};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

const COLUMNS: &str = "series_id, run_id, last_synced_date, last_observation_date, \
     total_count, processed_count, status, held, created_at, updated_at";

/// Raw column values, converted after the row borrow ends
struct CheckpointRow {
    series_id: String,
    run_id: String,
    last_synced_date: Option<String>,
    last_observation_date: Option<String>,
    total_count: i64,
    processed_count: i64,
    status: String,
    held: bool,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok(CheckpointRow {
        series_id: row.get(0)?,
        run_id: row.get(1)?,
        last_synced_date: row.get(2)?,
        last_observation_date: row.get(3)?,
        total_count: row.get(4)?,
        processed_count: row.get(5)?,
        status: row.get(6)?,
        held: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn optional_date(text: Option<String>) -> Result<Option<NaiveDate>> {
    text.map(|t| {
        parse_date(&t).ok_or_else(|| SyncError::store(format!("unreadable checkpoint date: {}", t), false))
    })
    .transpose()
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        Ok(Checkpoint {
            last_synced_date: optional_date(self.last_synced_date)?,
            last_observation_date: optional_date(self.last_observation_date)?,
            total_count: self.total_count.max(0) as u64,
            processed_count: self.processed_count.max(0) as u64,
            status: self
                .status
                .parse::<CheckpointStatus>()
                .map_err(|e| SyncError::store(e, false))?,
            held: self.held,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            series_id: self.series_id,
            run_id: self.run_id,
        })
    }
}

pub fn load_checkpoint(conn: &Connection, series_id: &str) -> Result<Option<Checkpoint>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM checkpoints WHERE series_id = ?", COLUMNS),
            [series_id],
            read_row,
        )
        .optional()?;

    row.map(CheckpointRow::into_checkpoint).transpose()
}

/// Single-statement upsert, so the checkpoint lands whole or not at all
pub fn save_checkpoint(conn: &Connection, series_id: &str, checkpoint: &Checkpoint) -> Result<()> {
    conn.execute(
        "INSERT INTO checkpoints (series_id, run_id, last_synced_date, last_observation_date,
                                  total_count, processed_count, status, held, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(series_id) DO UPDATE SET
           run_id = excluded.run_id,
           last_synced_date = excluded.last_synced_date,
           last_observation_date = excluded.last_observation_date,
           total_count = excluded.total_count,
           processed_count = excluded.processed_count,
           status = excluded.status,
           held = excluded.held,
           created_at = excluded.created_at,
           updated_at = excluded.updated_at",
        rusqlite::params![
            series_id,
            checkpoint.run_id,
            checkpoint.last_synced_date.map(format_date),
            checkpoint.last_observation_date.map(format_date),
            checkpoint.total_count as i64,
            checkpoint.processed_count as i64,
            checkpoint.status.as_str(),
            checkpoint.held,
            timestamp(checkpoint.created_at),
            timestamp(checkpoint.updated_at),
        ],
    )?;
    Ok(())
}

pub fn list_checkpoints(conn: &Connection) -> Result<Vec<Checkpoint>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM checkpoints ORDER BY series_id",
        COLUMNS
    ))?;

    let rows = stmt
        .query_map([], read_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
}

/// Delete completed, unheld checkpoints last touched before `cutoff`
pub fn prune_completed(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM checkpoints WHERE status = ? AND held = 0 AND updated_at < ?",
        rusqlite::params![CheckpointStatus::Completed.as_str(), timestamp(cutoff)],
    )?;

    if removed > 0 {
        tracing::info!("Pruned {} completed checkpoint(s)", removed);
    }
    Ok(removed)
}
