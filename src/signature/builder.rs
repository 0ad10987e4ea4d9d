//! Per-partition signature construction.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::{
    to_hours, ColumnKind, ColumnSpec, FeatureValue, FeederTable, SignatureKey, SignatureTable,
    SpecialColumn, TargetColumns, TargetLabel,
};
use crate::anomaly::AnomalyRecord;
use crate::classify::Ticket;

/// Anomaly types that count towards a triple threat.
pub const TRIPLE_THREAT_TYPES: &[&str] = &[
    "PF_SPIKES",
    "THD_SPIKES",
    "ZERO_CURRENT",
    "ZERO_POWER",
    "ZERO_VOLTAGE",
];

const MS_PER_YEAR: f64 = 365.0 * 24.0 * 3_600_000.0;

/// Builds signature rows for one partition of feeders.
pub struct SignatureBuilder<'a> {
    specs: &'a [ColumnSpec],
    feeders: &'a FeederTable,
    target: TargetColumns,
}

impl<'a> SignatureBuilder<'a> {
    pub fn new(specs: &'a [ColumnSpec], feeders: &'a FeederTable) -> Self {
        Self {
            specs,
            feeders,
            target: TargetColumns::default(),
        }
    }

    pub fn with_target(mut self, target: TargetColumns) -> Self {
        self.target = target;
        self
    }

    pub fn empty_table(&self) -> SignatureTable {
        SignatureTable::new(
            self.specs.iter().map(|s| s.name.clone()).collect(),
            vec![self.target.clone()],
        )
    }

    /// Build rows for every feeder in `partition`, in partition order.
    ///
    /// `anomalies` holds cleaned records grouped by feeder and sorted by time.
    /// When `tickets` is given each row starts with the earliest outage after
    /// `t - 1h`; otherwise labels start empty.
    pub fn build(
        &self,
        anomalies: &BTreeMap<String, Vec<AnomalyRecord>>,
        tickets: Option<&BTreeMap<String, Vec<Ticket>>>,
        partition: &[String],
    ) -> SignatureTable {
        let mut table = self.empty_table();
        for feeder in partition {
            let records = match anomalies.get(feeder) {
                Some(r) => r,
                None => continue,
            };
            let feeder_tickets =
                tickets.map(|t| t.get(feeder).map(Vec::as_slice).unwrap_or_default());
            let before = table.len();
            self.build_feeder(&mut table, feeder, records, feeder_tickets);
            debug!(%feeder, rows = table.len() - before, "feeder signatures built");
        }
        self.fill_metadata(&mut table);
        table
    }

    fn build_feeder(
        &self,
        table: &mut SignatureTable,
        feeder: &str,
        records: &[AnomalyRecord],
        tickets: Option<&[Ticket]>,
    ) {
        let triggers: HashSet<&str> = self
            .specs
            .iter()
            .filter(|s| s.kind == ColumnKind::Trigger)
            .map(|s| s.lookup.as_str())
            .collect();
        let row_times: BTreeSet<DateTime<Utc>> = records
            .iter()
            .filter(|r| triggers.contains(r.anomaly_type.as_str()))
            .map(|r| r.timestamp)
            .collect();
        if row_times.is_empty() {
            return;
        }
        let threats = triple_threats(records);

        for t in row_times {
            let label = tickets
                .map(|tk| initial_label(t, tk))
                .unwrap_or_default();
            let features = self
                .specs
                .iter()
                .map(|spec| feature(spec, t, records, &threats))
                .collect();
            table.push(
                SignatureKey {
                    feeder_id: feeder.to_string(),
                    timestamp: t,
                    labels: vec![label],
                },
                features,
            );
        }
    }

    /// Fill constant and duration columns from feeder metadata.
    fn fill_metadata(&self, table: &mut SignatureTable) {
        for (col, spec) in self.specs.iter().enumerate() {
            if !matches!(spec.kind, ColumnKind::Constant | ColumnKind::Duration) {
                continue;
            }
            for (key, row) in table.y.iter().zip(table.x.iter_mut()) {
                let meta = self.feeders.get(&key.feeder_id);
                row[col] = match spec.kind {
                    ColumnKind::Constant => meta
                        .and_then(|m| m.constants.get(&spec.name))
                        .map(|&v| FeatureValue::Number(v))
                        .unwrap_or(FeatureValue::Missing),
                    _ => meta
                        .and_then(|m| m.dates.get(&spec.name))
                        .map(|&date| FeatureValue::Number(years_between(date, key.timestamp)))
                        .unwrap_or(FeatureValue::Missing),
                };
            }
        }
    }
}

/// Whole 365-day years from `from` to `to`, floored.
pub fn years_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / MS_PER_YEAR).floor()
}

/// Earliest outage after `t - 1h`, as hours from `t`.
fn initial_label(t: DateTime<Utc>, tickets: &[Ticket]) -> TargetLabel {
    let cutoff = t - Duration::hours(1);
    let mut best: Option<&Ticket> = None;
    for tk in tickets.iter().filter(|tk| tk.power_off > cutoff) {
        if best.map_or(true, |b| tk.power_off < b.power_off) {
            best = Some(tk);
        }
    }
    match best {
        Some(tk) => TargetLabel {
            outage_hours: Some(to_hours(tk.power_off - t)),
            ticket_id: Some(tk.ticket_id.clone()),
        },
        None => TargetLabel::default(),
    }
}

/// Instants where more than two distinct triple-threat types coincide.
fn triple_threats(records: &[AnomalyRecord]) -> Vec<DateTime<Utc>> {
    let mut seen = HashSet::new();
    let mut per_time: BTreeMap<DateTime<Utc>, usize> = BTreeMap::new();
    for r in records
        .iter()
        .filter(|r| TRIPLE_THREAT_TYPES.contains(&r.anomaly_type.as_str()))
    {
        if seen.insert((r.anomaly_type.as_str(), r.timestamp)) {
            *per_time.entry(r.timestamp).or_insert(0) += 1;
        }
    }
    per_time
        .into_iter()
        .filter(|&(_, n)| n > 2)
        .map(|(t, _)| t)
        .collect()
}

fn feature(
    spec: &ColumnSpec,
    t: DateTime<Utc>,
    records: &[AnomalyRecord],
    threats: &[DateTime<Utc>],
) -> FeatureValue {
    match spec.kind {
        ColumnKind::Trigger
        | ColumnKind::Flag
        | ColumnKind::Background
        | ColumnKind::Cluster
        | ColumnKind::Sequence => {
            let matches: Vec<DateTime<Utc>> = records
                .iter()
                .filter(|r| r.anomaly_type == spec.lookup && spec.contains(t, r.timestamp))
                .map(|r| r.timestamp)
                .collect();
            lookup_value(spec.kind, t, &matches)
        }
        ColumnKind::Special(SpecialColumn::Deprecated) => FeatureValue::Count(0),
        ColumnKind::Special(SpecialColumn::TripleThreat) => {
            FeatureValue::Count(threats.iter().filter(|&&i| spec.contains(t, i)).count() as u64)
        }
        // filled once the table is complete
        ColumnKind::Duration | ColumnKind::Constant => FeatureValue::Count(0),
    }
}

/// Value of a lookup column given the time-sorted matches in its window.
fn lookup_value(kind: ColumnKind, t: DateTime<Utc>, matches: &[DateTime<Utc>]) -> FeatureValue {
    match kind {
        ColumnKind::Sequence => FeatureValue::Days(
            matches
                .iter()
                .map(|&m| (t - m).num_seconds().div_euclid(86_400))
                .collect(),
        ),
        _ if matches.is_empty() => FeatureValue::Count(0),
        ColumnKind::Flag => FeatureValue::Count(1),
        ColumnKind::Cluster => {
            let gaps = matches
                .windows(2)
                .filter(|w| w[1] - w[0] > Duration::hours(1))
                .count();
            FeatureValue::Count(1 + gaps as u64)
        }
        _ => FeatureValue::Count(matches.len() as u64),
    }
}
