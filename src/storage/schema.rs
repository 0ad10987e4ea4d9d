//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY,
            kind TEXT NOT NULL,
            columns_json TEXT,
            targets_json TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS anomalies (
            id INTEGER PRIMARY KEY,
            run_id INTEGER NOT NULL REFERENCES runs(id),
            feeder_id TEXT NOT NULL,
            anomaly TEXT NOT NULL,
            time TEXT NOT NULL,
            signal TEXT NOT NULL,
            device_type TEXT NOT NULL,
            device_id TEXT NOT NULL,
            device_phase TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS signatures (
            id INTEGER PRIMARY KEY,
            run_id INTEGER NOT NULL REFERENCES runs(id),
            feeder_id TEXT NOT NULL,
            time TEXT NOT NULL,
            features_json TEXT NOT NULL,
            labels_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_anomalies_feeder ON anomalies(run_id, feeder_id, time);
        CREATE INDEX IF NOT EXISTS idx_signatures_feeder ON signatures(run_id, feeder_id, time);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
