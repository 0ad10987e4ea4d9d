//! In-memory anomaly collection with column-store export.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AnomalyRecord;
use crate::error::{PamError, Result};

/// The anomalies produced by one extraction run.
#[derive(Debug, Clone, Default)]
pub struct AnomalyStore {
    records: Vec<AnomalyRecord>,
    extracted: bool,
}

/// Column-oriented view of a store, one vector per field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyColumns {
    pub feeder: Vec<String>,
    pub anomaly: Vec<String>,
    pub time: Vec<DateTime<Utc>>,
    pub signal: Vec<String>,
    pub device_type: Vec<String>,
    pub device_id: Vec<String>,
    pub device_phase: Vec<String>,
}

impl AnomalyColumns {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Back to rows. Ragged columns are cut to the shortest.
    pub fn into_records(self) -> Vec<AnomalyRecord> {
        let mut device_type = self.device_type.into_iter();
        let mut device_id = self.device_id.into_iter();
        let mut device_phase = self.device_phase.into_iter();
        self.feeder
            .into_iter()
            .zip(self.anomaly)
            .zip(self.time)
            .zip(self.signal)
            .map_while(|(((feeder_id, anomaly_type), timestamp), source_signal)| {
                Some(AnomalyRecord {
                    feeder_id,
                    anomaly_type,
                    timestamp,
                    source_signal,
                    device_type: device_type.next()?,
                    device_id: device_id.next()?,
                    device_phase: device_phase.next()?,
                })
            })
            .collect()
    }
}

impl AnomalyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap records that came out of a finished extraction.
    pub fn from_records(records: Vec<AnomalyRecord>) -> Self {
        Self {
            records,
            extracted: true,
        }
    }

    /// Append the output of one classifier pass.
    pub fn append(&mut self, records: Vec<AnomalyRecord>) {
        self.records.extend(records);
        self.extracted = true;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[AnomalyRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<AnomalyRecord> {
        self.records
    }

    /// Keep one record per (type, feeder, timestamp) for every type in
    /// `dedupe`; records of other types are left untouched. First occurrence
    /// wins and relative order is preserved.
    pub fn dedup(&mut self, dedupe: &HashSet<String>) {
        let mut seen: HashSet<(String, String, DateTime<Utc>)> = HashSet::new();
        self.records.retain(|r| {
            if !dedupe.contains(&r.anomaly_type) {
                return true;
            }
            seen.insert((r.anomaly_type.clone(), r.feeder_id.clone(), r.timestamp))
        });
    }

    /// Anomaly count per feeder.
    pub fn feeder_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.records {
            *counts.entry(r.feeder_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Records grouped by feeder, each group sorted by time (stable).
    pub fn by_feeder(&self) -> BTreeMap<String, Vec<AnomalyRecord>> {
        let mut groups: BTreeMap<String, Vec<AnomalyRecord>> = BTreeMap::new();
        for r in &self.records {
            groups.entry(r.feeder_id.clone()).or_default().push(r.clone());
        }
        for group in groups.values_mut() {
            group.sort_by_key(|r| r.timestamp);
        }
        groups
    }

    /// Export as columns. Fails if nothing has been extracted into the store.
    pub fn to_columns(&self) -> Result<AnomalyColumns> {
        if !self.extracted {
            return Err(PamError::NotExtracted);
        }
        let mut cols = AnomalyColumns::default();
        for r in &self.records {
            cols.feeder.push(r.feeder_id.clone());
            cols.anomaly.push(r.anomaly_type.clone());
            cols.time.push(r.timestamp);
            cols.signal.push(r.source_signal.clone());
            cols.device_type.push(r.device_type.clone());
            cols.device_id.push(r.device_id.clone());
            cols.device_phase.push(r.device_phase.clone());
        }
        Ok(cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{AnomalyBuilder, Device};
    use chrono::TimeZone;

    fn records() -> Vec<AnomalyRecord> {
        let t = Utc.with_ymd_and_hms(2015, 3, 1, 12, 0, 0).unwrap();
        let mut b = AnomalyBuilder::new("100001");
        b.push("ZERO_CURRENT", t, "p1", Device::none());
        b.push("ZERO_CURRENT", t, "p2", Device::none());
        b.push("FAULT_CURRENT", t, "f1", Device::none());
        b.push("FAULT_CURRENT", t, "f2", Device::none());
        b.finish()
    }

    #[test]
    fn test_export_before_extract_fails() {
        let store = AnomalyStore::new();
        assert!(matches!(store.to_columns(), Err(PamError::NotExtracted)));
    }

    #[test]
    fn test_empty_extraction_exports() {
        let mut store = AnomalyStore::new();
        store.append(Vec::new());
        let cols = store.to_columns().unwrap();
        assert!(cols.is_empty());
    }

    #[test]
    fn test_dedup_only_touches_listed_types() {
        let mut store = AnomalyStore::from_records(records());
        let dedupe: HashSet<String> = ["ZERO_CURRENT".to_string()].into_iter().collect();
        store.dedup(&dedupe);

        let cols = store.to_columns().unwrap();
        assert_eq!(cols.len(), 3);
        assert_eq!(cols.anomaly.iter().filter(|a| *a == "ZERO_CURRENT").count(), 1);
        assert_eq!(cols.anomaly.iter().filter(|a| *a == "FAULT_CURRENT").count(), 2);
        assert_eq!(cols.signal[0], "p1");

        let rows = cols.into_records();
        assert_eq!(rows, store.into_records());
    }
}
