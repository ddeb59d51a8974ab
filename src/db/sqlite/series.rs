//! Series registry

use crate::error::{Result, SyncError};
use crate::types::{Frequency, Priority, SeriesSpec};
use rusqlite::{Connection, OptionalExtension, Row};

struct SeriesRow {
    id: String,
    title: String,
    frequency: String,
    priority: String,
    allow_negative: bool,
    lookback_years: Option<u32>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<SeriesRow> {
    Ok(SeriesRow {
        id: row.get(0)?,
        title: row.get(1)?,
        frequency: row.get(2)?,
        priority: row.get(3)?,
        allow_negative: row.get::<_, i32>(4)? == 1,
        lookback_years: row.get(5)?,
    })
}

impl SeriesRow {
    fn into_spec(self) -> Result<SeriesSpec> {
        Ok(SeriesSpec {
            frequency: self
                .frequency
                .parse::<Frequency>()
                .map_err(|e| SyncError::store(e, false))?,
            priority: self
                .priority
                .parse::<Priority>()
                .map_err(|e| SyncError::store(e, false))?,
            id: self.id,
            title: self.title,
            allow_negative: self.allow_negative,
            lookback_years: self.lookback_years,
        })
    }
}

pub fn upsert_series(conn: &Connection, spec: &SeriesSpec) -> Result<()> {
    conn.execute(
        "INSERT INTO series (id, title, frequency, priority, allow_negative, lookback_years)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           title = excluded.title,
           frequency = excluded.frequency,
           priority = excluded.priority,
           allow_negative = excluded.allow_negative,
           lookback_years = excluded.lookback_years,
           updated_at = datetime('now')",
        rusqlite::params![
            spec.id,
            spec.title,
            spec.frequency.as_str(),
            spec.priority.as_str(),
            spec.allow_negative as i32,
            spec.lookback_years,
        ],
    )?;
    Ok(())
}

pub fn list_series(conn: &Connection) -> Result<Vec<SeriesSpec>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, frequency, priority, allow_negative, lookback_years
         FROM series ORDER BY id",
    )?;

    let rows = stmt
        .query_map([], read_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(SeriesRow::into_spec).collect()
}

pub fn get_series(conn: &Connection, series_id: &str) -> Result<Option<SeriesSpec>> {
    let row = conn
        .query_row(
            "SELECT id, title, frequency, priority, allow_negative, lookback_years
             FROM series WHERE id = ?",
            [series_id],
            read_row,
        )
        .optional()?;

    row.map(SeriesRow::into_spec).transpose()
}
