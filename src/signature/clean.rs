//! Anomaly cleaning applied once before signatures are built.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{ColumnSpec, FeederTable};
use crate::anomaly::{truncate_to_minute, AnomalyRecord, AnomalyStore};

const PHASES: &[&str] = &["A", "B", "C"];
const GROUND: &str = "G";

/// Normalize raw anomalies for the signature stage:
///
/// 1. truncate every timestamp to the minute;
/// 2. drop feeders that are ignored or have no metadata;
/// 3. rename through `anomaly_map`, dropping unmapped names;
/// 4. when a column asks for phase faults, derive `{k}_PH_*` and `G_PH_*`
///    aggregates from the mapped fault records;
/// 5. keep only lookups a column declares `keep_all` for, de-duplicating
///    those declared `keep_all = false`.
pub fn clean(
    records: &[AnomalyRecord],
    specs: &[ColumnSpec],
    anomaly_map: &BTreeMap<String, String>,
    feeders: &FeederTable,
) -> AnomalyStore {
    let mapped: Vec<AnomalyRecord> = records
        .iter()
        .filter(|r| feeders.is_usable(&r.feeder_id))
        .filter_map(|r| {
            let name = anomaly_map.get(&r.anomaly_type)?;
            let mut r = r.clone();
            r.anomaly_type = name.clone();
            r.timestamp = truncate_to_minute(r.timestamp);
            Some(r)
        })
        .collect();

    let faults = if specs.iter().any(|s| s.name.contains("PH_FAULT")) {
        phase_faults(&mapped)
    } else {
        Vec::new()
    };

    let dedupe: HashSet<String> = specs
        .iter()
        .filter(|s| s.keep_all == Some(false))
        .map(|s| s.lookup.clone())
        .collect();
    let keep: HashSet<&str> = specs
        .iter()
        .filter(|s| s.keep_all.is_some())
        .map(|s| s.lookup.as_str())
        .collect();

    let mut store = AnomalyStore::from_records(
        mapped
            .into_iter()
            .filter(|r| keep.contains(r.anomaly_type.as_str()))
            .collect(),
    );
    store.dedup(&dedupe);
    let kept = store.len();
    store.append(faults);

    info!(
        input = records.len(),
        kept,
        phase_faults = store.len() - kept,
        "anomalies cleaned"
    );
    store
}

/// Fault records grouped per (feeder, minute, name without `TEMP_`).
fn phase_faults(mapped: &[AnomalyRecord]) -> Vec<AnomalyRecord> {
    let mut groups: BTreeMap<(String, DateTime<Utc>, String), Vec<&AnomalyRecord>> =
        BTreeMap::new();
    let mut out = Vec::new();
    let mut grounds = Vec::new();

    for r in mapped.iter().filter(|r| r.anomaly_type.contains("FAULT")) {
        let base = r.anomaly_type.replace("TEMP_", "");
        if PHASES.contains(&r.device_phase.as_str()) {
            groups
                .entry((r.feeder_id.clone(), r.timestamp, base))
                .or_default()
                .push(r);
        } else if r.device_phase == GROUND {
            let mut g = r.clone();
            g.anomaly_type = format!("G_PH_{base}");
            grounds.push(g);
        }
    }

    for ((feeder, time, base), members) in groups {
        let phases: BTreeSet<&str> = members.iter().map(|r| r.device_phase.as_str()).collect();
        out.push(AnomalyRecord {
            feeder_id: feeder,
            anomaly_type: format!("{}_PH_{}", phases.len(), base),
            timestamp: time,
            source_signal: join_unique(members.iter().map(|r| r.source_signal.as_str())),
            device_type: join_unique(members.iter().map(|r| r.device_type.as_str())),
            device_id: join_unique(members.iter().map(|r| r.device_id.as_str())),
            device_phase: join_unique(members.iter().map(|r| r.device_phase.as_str())),
        });
    }
    debug!(multi_phase = out.len(), ground = grounds.len(), "phase faults derived");
    out.extend(grounds);
    out
}

/// Distinct values in first-seen order, comma separated.
fn join_unique<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let mut seen = HashSet::new();
    values
        .filter(|v| seen.insert(*v))
        .collect::<Vec<_>>()
        .join(", ")
}
