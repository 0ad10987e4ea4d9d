//! Smart-meter last gasp rules.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Classifier, Selection};
use crate::anomaly::{truncate_to_minute, AnomalyBuilder, AnomalyRecord, Device, NOT_APPLICABLE};
use crate::error::Result;
use crate::table::{lenient_string, EventTable};

const SOURCE: &str = "ami";

pub const COLUMNS: &[&str] = &["feeder_id", "meter", "time", "event_id"];

pub const ANOMALIES: &[&str] = &["LG_PD_10", "LG_PD_10_V2"];
const DEFAULT: &[&str] = &["LG_PD_10_V2"];

/// Last gasp and NIC power down.
const POWER_DOWN_EVENTS: &[&str] = &["12007", "12024"];

/// Share of a feeder's customers that must report for an outage signal.
const CUSTOMER_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterEvent {
    #[serde(deserialize_with = "lenient_string")]
    pub feeder_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub meter: String,
    pub time: DateTime<Utc>,
    #[serde(deserialize_with = "lenient_string")]
    pub event_id: String,
}

/// Needs the customer count of every feeder it is asked about.
#[derive(Debug, Clone, Default)]
pub struct AmiClassifier {
    customers: HashMap<String, u64>,
}

impl AmiClassifier {
    pub fn new(customers: HashMap<String, u64>) -> Self {
        Self { customers }
    }
}

fn signal(pct: f64, meters: usize) -> String {
    format!(
        "LAST GASPS / POWER DOWNS AT {:.1}% OF FEEDER CUSTOMERS ({} METERS)",
        100.0 * pct,
        meters
    )
}

fn device() -> Device {
    Device::new("AMI", NOT_APPLICABLE, NOT_APPLICABLE)
}

impl Classifier for AmiClassifier {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn all_anomalies(&self) -> &'static [&'static str] {
        ANOMALIES
    }

    fn default_anomalies(&self) -> &'static [&'static str] {
        DEFAULT
    }

    fn required_columns(&self) -> &'static [&'static str] {
        COLUMNS
    }

    fn row_time_column(&self) -> Option<&'static str> {
        Some("time")
    }

    fn feeders(&self, table: &EventTable) -> Result<BTreeSet<String>> {
        let events: Vec<MeterEvent> = table.decode(SOURCE, COLUMNS)?;
        Ok(events.into_iter().map(|e| e.feeder_id).collect())
    }

    fn extract(
        &self,
        table: &EventTable,
        feeder_id: &str,
        selection: &Selection,
    ) -> Result<Vec<AnomalyRecord>> {
        let selected = selection.resolve(SOURCE, ANOMALIES, DEFAULT)?;
        let events: Vec<MeterEvent> = table.decode(SOURCE, COLUMNS)?;

        let customers = match self.customers.get(feeder_id) {
            Some(&c) if c > 0 => c as f64,
            _ => {
                warn!(feeder = %feeder_id, "no customer count, skipping meter events");
                return Ok(Vec::new());
            }
        };

        let mut seen = HashSet::new();
        let mut per_minute: BTreeMap<DateTime<Utc>, BTreeSet<&str>> = BTreeMap::new();
        for e in events
            .iter()
            .filter(|e| e.feeder_id == feeder_id)
            .filter(|e| seen.insert((e.meter.as_str(), e.time, e.event_id.as_str())))
            .filter(|e| POWER_DOWN_EVENTS.contains(&e.event_id.as_str()))
            .filter(|e| e.meter.starts_with('G'))
        {
            per_minute
                .entry(truncate_to_minute(e.time))
                .or_default()
                .insert(e.meter.as_str());
        }

        let mut pass = AnomalyBuilder::new(feeder_id);
        if selected.contains("LG_PD_10") {
            pass.merge(clustered(feeder_id, &per_minute, customers));
        }
        if selected.contains("LG_PD_10_V2") {
            let mut step = AnomalyBuilder::new(feeder_id);
            for (&minute, meters) in &per_minute {
                if meters.len() as f64 > CUSTOMER_FRACTION * customers {
                    let pct = meters.len() as f64 / customers;
                    step.push("LG_PD_10_V2", minute, signal(pct, meters.len()), device());
                }
            }
            pass.merge(step);
        }
        Ok(pass.finish())
    }
}

/// Minutes with more than one reporting meter, merged with every other such
/// minute in the following five minutes.
fn clustered(
    feeder_id: &str,
    per_minute: &BTreeMap<DateTime<Utc>, BTreeSet<&str>>,
    customers: f64,
) -> AnomalyBuilder {
    let candidates: Vec<(DateTime<Utc>, &BTreeSet<&str>)> = per_minute
        .iter()
        .filter(|(_, meters)| meters.len() > 1)
        .map(|(&t, meters)| (t, meters))
        .collect();

    let mut step = AnomalyBuilder::new(feeder_id);
    let mut emitted = HashSet::new();
    for (i, &(t, _)) in candidates.iter().enumerate() {
        let horizon = t + Duration::minutes(5);
        let cluster: Vec<&(DateTime<Utc>, &BTreeSet<&str>)> = candidates[i..]
            .iter()
            .take_while(|(t2, _)| *t2 <= horizon)
            .collect();
        let meters: BTreeSet<&str> = cluster
            .iter()
            .flat_map(|(_, m)| m.iter().copied())
            .collect();
        let last = cluster.last().map(|(t2, _)| *t2).unwrap_or(t);
        let pct = meters.len() as f64 / customers;
        if pct > CUSTOMER_FRACTION && emitted.insert(last) {
            step.push("LG_PD_10", last, signal(pct, meters.len()), device());
        }
    }
    step
}
