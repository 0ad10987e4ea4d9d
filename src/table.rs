//! Canonical event tables handed over by the per-source adapters.
//!
//! A table is a list of named columns plus one JSON object per row. Typed
//! decoding happens only after the required columns have been checked, so a
//! schema problem is reported by column name instead of as a serde failure on
//! the first row.

use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{PamError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventTable {
    pub columns: Vec<String>,
    #[serde(default)]
    pub records: Vec<Map<String, Value>>,
}

impl EventTable {
    /// Build a table from typed rows. Column names are taken from `columns`
    /// so that an empty table still carries its schema.
    pub fn from_rows<T: Serialize>(columns: &[&str], rows: &[T]) -> Self {
        let records = rows
            .iter()
            .filter_map(|row| match serde_json::to_value(row) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            })
            .collect();
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            records,
        }
    }

    /// Load a table from a JSON document on disk.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read table: {}", path.display()))?;
        let table: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse table: {}", path.display()))?;
        tracing::debug!(path = %path.display(), rows = table.records.len(), "loaded event table");
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fail with a schema error listing every required column that is absent.
    pub fn require(&self, table: &str, required: &[&str]) -> Result<()> {
        let missing: Vec<String> = required
            .iter()
            .filter(|col| !self.columns.iter().any(|c| c == *col))
            .map(|col| col.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PamError::MissingColumns {
                table: table.to_string(),
                missing,
            })
        }
    }

    /// Check the schema, then decode every record into `T`.
    pub fn decode<T: DeserializeOwned>(&self, table: &str, required: &[&str]) -> Result<Vec<T>> {
        self.require(table, required)?;
        self.records
            .iter()
            .enumerate()
            .map(|(row, record)| {
                serde_json::from_value(Value::Object(record.clone())).map_err(|source| {
                    PamError::Decode {
                        table: table.to_string(),
                        row,
                        source,
                    }
                })
            })
            .collect()
    }
}

/// Accept a number, a numeric string (optionally quoted twice), or anything
/// else as `0.0`. Upstream exports are not consistent about value columns.
pub fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.replace('"', "").trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

/// Accept a string or a number for identifier columns.
pub fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}
