//! SQLite database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Run all database migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    run_migration(conn, "001_series", CREATE_SERIES_TABLE)?;
    run_migration(conn, "002_checkpoints", CREATE_CHECKPOINTS_TABLE)?;
    run_migration(conn, "003_sync_runs", CREATE_SYNC_RUNS_TABLE)?;
    run_migration(conn, "004_checkpoint_hold", ADD_CHECKPOINT_HOLD)?;

    tracing::info!("Database migrations completed");
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?)",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        tracing::info!("Running migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;
    }

    Ok(())
}

const CREATE_SERIES_TABLE: &str = r#"
CREATE TABLE series (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    frequency TEXT NOT NULL,
    priority TEXT NOT NULL DEFAULT 'medium',
    allow_negative INTEGER NOT NULL DEFAULT 0,
    lookback_years INTEGER,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

const CREATE_CHECKPOINTS_TABLE: &str = r#"
CREATE TABLE checkpoints (
    series_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    last_synced_date TEXT,
    last_observation_date TEXT,
    total_count INTEGER NOT NULL DEFAULT 0,
    processed_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX idx_checkpoints_status ON checkpoints(status, updated_at);
"#;

const ADD_CHECKPOINT_HOLD: &str = r#"
ALTER TABLE checkpoints ADD COLUMN held INTEGER NOT NULL DEFAULT 0;
"#;

const CREATE_SYNC_RUNS_TABLE: &str = r#"
CREATE TABLE sync_runs (
    run_id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    phase TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    total_series INTEGER NOT NULL DEFAULT 0,
    failed_series INTEGER NOT NULL DEFAULT 0,
    processed_records INTEGER NOT NULL DEFAULT 0,
    report TEXT NOT NULL
);

CREATE INDEX idx_sync_runs_started ON sync_runs(started_at);
"#;
