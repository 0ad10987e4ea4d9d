//! Normalized anomaly records and the append-only builder used by every
//! classifier pass.

pub mod store;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

pub use store::{AnomalyColumns, AnomalyStore};

/// Placeholder for a sub-attribute that does not apply to a record.
pub const NOT_APPLICABLE: &str = "-";
/// Placeholder for a sub-attribute that could not be parsed.
pub const UNKNOWN: &str = "UNKNOWN";

/// Drop seconds and sub-second precision.
pub fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::minutes(1)).unwrap_or(t)
}

/// One observed anomaly on one feeder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub feeder_id: String,
    pub anomaly_type: String,
    pub timestamp: DateTime<Utc>,
    pub source_signal: String,
    pub device_type: String,
    pub device_id: String,
    pub device_phase: String,
}

/// Parsed device attributes attached to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub kind: String,
    pub id: String,
    pub phase: String,
}

impl Device {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            phase: phase.into(),
        }
    }

    /// A device with every attribute set to `"-"`.
    pub fn none() -> Self {
        Self::new(NOT_APPLICABLE, NOT_APPLICABLE, NOT_APPLICABLE)
    }

    /// Same device with a different phase.
    pub fn with_phase(&self, phase: impl Into<String>) -> Self {
        Self {
            kind: self.kind.clone(),
            id: self.id.clone(),
            phase: phase.into(),
        }
    }
}

/// Collects the records produced by one rule step for one feeder.
///
/// Rule steps never share a builder: each step fills its own and the pass
/// merges them once at the end, so a skipped step leaves nothing behind.
#[derive(Debug, Default)]
pub struct AnomalyBuilder {
    feeder_id: String,
    records: Vec<AnomalyRecord>,
}

impl AnomalyBuilder {
    pub fn new(feeder_id: &str) -> Self {
        Self {
            feeder_id: feeder_id.to_string(),
            records: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        anomaly_type: &str,
        timestamp: DateTime<Utc>,
        source_signal: impl Into<String>,
        device: Device,
    ) {
        self.records.push(AnomalyRecord {
            feeder_id: self.feeder_id.clone(),
            anomaly_type: anomaly_type.to_string(),
            timestamp,
            source_signal: source_signal.into(),
            device_type: device.kind,
            device_id: device.id,
            device_phase: device.phase,
        });
    }

    /// Append everything another step produced.
    pub fn merge(&mut self, other: AnomalyBuilder) {
        self.records.extend(other.records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn finish(self) -> Vec<AnomalyRecord> {
        self.records
    }
}
