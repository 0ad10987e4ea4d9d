//! SQLite storage layer -- schema, migrations, and run persistence.

pub mod schema;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Transaction};

use crate::anomaly::AnomalyStore;
use crate::config::StorageConfig;
use crate::signature::{SignatureKey, SignatureTable};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database with the configured connection
/// settings, migrate it, and return a pool.
pub fn open_pool(path: &str, settings: &StorageConfig) -> Result<Pool> {
    let journal_mode = settings.journal_mode.clone();
    let synchronous = settings.synchronous.clone();
    let busy_timeout = Duration::from_millis(settings.busy_timeout_ms);
    let manager = SqliteConnectionManager::file(path).with_init(move |c| {
        c.pragma_update_and_check(None, "journal_mode", &journal_mode, |row| {
            row.get::<_, String>(0)
        })?;
        c.pragma_update(None, "synchronous", &synchronous)?;
        c.pragma_update(None, "foreign_keys", true)?;
        c.busy_timeout(busy_timeout)
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open SQLite pool at {path}"))?;
    schema::migrate(&*pool.get()?)?;
    tracing::debug!(path, journal_mode = %settings.journal_mode, "storage ready");
    Ok(pool)
}

fn begin_run(
    tx: &Transaction<'_>,
    kind: &str,
    columns_json: Option<String>,
    targets_json: Option<String>,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO runs (kind, columns_json, targets_json) VALUES (?1, ?2, ?3)",
        params![kind, columns_json, targets_json],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Persist an extraction run. Returns the run id.
pub fn save_anomalies(pool: &Pool, store: &AnomalyStore) -> Result<i64> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let run_id = begin_run(&tx, "extract", None, None)?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO anomalies
                (run_id, feeder_id, anomaly, time, signal, device_type, device_id, device_phase)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for r in store.records() {
            stmt.execute(params![
                run_id,
                r.feeder_id,
                r.anomaly_type,
                r.timestamp.to_rfc3339(),
                r.source_signal,
                r.device_type,
                r.device_id,
                r.device_phase,
            ])?;
        }
    }
    tx.commit()?;
    tracing::info!(run_id, anomalies = store.len(), "anomalies saved");
    Ok(run_id)
}

/// Persist a signature table. Features and labels are stored as JSON per row.
pub fn save_signatures(pool: &Pool, table: &SignatureTable) -> Result<i64> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let run_id = begin_run(
        &tx,
        "signatures",
        Some(serde_json::to_string(&table.columns)?),
        Some(serde_json::to_string(&table.targets)?),
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO signatures (run_id, feeder_id, time, features_json, labels_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (key, features) in table.y.iter().zip(&table.x) {
            stmt.execute(params![
                run_id,
                key.feeder_id,
                key.timestamp.to_rfc3339(),
                serde_json::to_string(features)?,
                serde_json::to_string(&key.labels)?,
            ])?;
        }
    }
    tx.commit()?;
    tracing::info!(run_id, rows = table.len(), "signatures saved");
    Ok(run_id)
}

/// Read back a saved signature table in insertion order.
pub fn load_signatures(pool: &Pool, run_id: i64) -> Result<SignatureTable> {
    let conn = pool.get()?;
    let (columns_json, targets_json): (Option<String>, Option<String>) = conn
        .query_row(
            "SELECT columns_json, targets_json FROM runs WHERE id = ?1 AND kind = 'signatures'",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .with_context(|| format!("no signature run {run_id}"))?;

    let mut table = SignatureTable::new(
        serde_json::from_str(columns_json.as_deref().unwrap_or("[]"))?,
        serde_json::from_str(targets_json.as_deref().unwrap_or("[]"))?,
    );

    let mut stmt = conn.prepare(
        "SELECT feeder_id, time, features_json, labels_json
         FROM signatures WHERE run_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([run_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;
    for row in rows {
        let (feeder_id, time, features, labels) = row?;
        let timestamp = DateTime::parse_from_rfc3339(&time)
            .with_context(|| format!("bad signature time {time}"))?
            .with_timezone(&Utc);
        table.push(
            SignatureKey {
                feeder_id,
                timestamp,
                labels: serde_json::from_str(&labels)?,
            },
            serde_json::from_str(&features)?,
        );
    }
    Ok(table)
}
