//! Sync run history

use super::timestamp;
use crate::error::Result;
use crate::sync::status::RunReport;
use rusqlite::{Connection, OptionalExtension};

/// Insert or replace the stored report for `report.run_id`
pub fn save_report(conn: &Connection, report: &RunReport) -> Result<()> {
    let json = serde_json::to_string(report)?;

    conn.execute(
        "INSERT INTO sync_runs (run_id, mode, phase, started_at, finished_at,
                               total_series, failed_series, processed_records, report)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(run_id) DO UPDATE SET
           phase = excluded.phase,
           finished_at = excluded.finished_at,
           total_series = excluded.total_series,
           failed_series = excluded.failed_series,
           processed_records = excluded.processed_records,
           report = excluded.report",
        rusqlite::params![
            report.run_id,
            report.mode.as_str(),
            report.phase.as_str(),
            timestamp(report.started_at),
            report.finished_at.map(timestamp),
            report.total_series as i64,
            report.failed_series as i64,
            report.processed_records as i64,
            json,
        ],
    )?;
    Ok(())
}

pub fn latest_report(conn: &Connection) -> Result<Option<RunReport>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT report FROM sync_runs ORDER BY started_at DESC, rowid DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
}

pub fn recent_reports(conn: &Connection, limit: usize) -> Result<Vec<RunReport>> {
    let mut stmt =
        conn.prepare("SELECT report FROM sync_runs ORDER BY started_at DESC, rowid DESC LIMIT ?")?;

    let rows = stmt
        .query_map([limit as i64], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.iter()
        .map(|json| Ok(serde_json::from_str(json)?))
        .collect()
}
