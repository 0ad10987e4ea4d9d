//! Feature vectors ("signatures") built from cleaned anomalies, one row per
//! trigger occurrence per feeder.

pub mod builder;
pub mod clean;
pub mod meta;
pub mod partition;
pub mod runner;
pub mod target;

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PamError, Result};

pub use builder::SignatureBuilder;
pub use meta::{FeederMeta, FeederTable};
pub use runner::SignatureTransformer;
pub use target::TargetAssigner;

/// Special column names kept only for schema compatibility; always zero.
pub const DEPRECATED_SPECIALS: &[&str] =
    &["FDR_GEO_0", "FDR_GEO_1", "FDR_GEO_2", "IS_DADE", "SIG_OUTLIER"];

/// Hours expressed as a chrono duration, millisecond precision.
pub fn hours(h: f64) -> Duration {
    Duration::milliseconds((h * 3_600_000.0).round() as i64)
}

/// Signed duration in fractional hours.
pub fn to_hours(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 3_600_000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialColumn {
    Deprecated,
    TripleThreat,
}

/// How a column's value is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Row-creating lookup; value is the count in the window.
    Trigger,
    /// 1 if the lookup occurs in the window.
    Flag,
    /// Count in the window.
    Background,
    /// Number of groups separated by gaps over an hour.
    Cluster,
    /// Whole-day offsets of every match.
    Sequence,
    Special(SpecialColumn),
    /// Years since a per-feeder reference date.
    Duration,
    /// Per-feeder metadata value.
    Constant,
}

impl ColumnKind {
    /// Whether the value is computed from the feeder's anomalies.
    pub fn is_lookup(self) -> bool {
        matches!(
            self,
            ColumnKind::Trigger
                | ColumnKind::Flag
                | ColumnKind::Background
                | ColumnKind::Cluster
                | ColumnKind::Sequence
        )
    }
}

/// Column definition as it appears in the pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpecConfig {
    pub name: String,
    #[serde(default)]
    pub lookup: String,
    pub kind: String,
    #[serde(default)]
    pub min_lag_hours: f64,
    #[serde(default)]
    pub max_lag_hours: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_all: Option<bool>,
}

/// A validated column definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub lookup: String,
    pub kind: ColumnKind,
    pub min_lag: Duration,
    pub max_lag: Duration,
    pub keep_all: Option<bool>,
}

impl ColumnSpec {
    /// Window `(t - max_lag, t - min_lag]` around a row timestamp.
    pub fn contains(&self, t: DateTime<Utc>, candidate: DateTime<Utc>) -> bool {
        candidate <= t - self.min_lag && candidate > t - self.max_lag
    }
}

impl TryFrom<ColumnSpecConfig> for ColumnSpec {
    type Error = PamError;

    fn try_from(cfg: ColumnSpecConfig) -> Result<Self> {
        let kind = match cfg.kind.as_str() {
            "trigger" => ColumnKind::Trigger,
            "flag" => ColumnKind::Flag,
            "background" => ColumnKind::Background,
            "cluster" => ColumnKind::Cluster,
            "sequence" => ColumnKind::Sequence,
            "duration" => ColumnKind::Duration,
            "constant" => ColumnKind::Constant,
            "special" if DEPRECATED_SPECIALS.contains(&cfg.name.as_str()) => {
                ColumnKind::Special(SpecialColumn::Deprecated)
            }
            "special" if cfg.name.contains("TRIPLE_THREAT") => {
                ColumnKind::Special(SpecialColumn::TripleThreat)
            }
            "special" => return Err(PamError::UnknownSpecialColumn(cfg.name)),
            other => {
                return Err(PamError::UnknownColumnKind {
                    column: cfg.name.clone(),
                    kind: other.to_string(),
                })
            }
        };
        Ok(Self {
            name: cfg.name,
            lookup: cfg.lookup,
            kind,
            min_lag: hours(cfg.min_lag_hours),
            max_lag: hours(cfg.max_lag_hours),
            keep_all: cfg.keep_all,
        })
    }
}

/// Validate a list of configured columns, failing on the first bad one.
pub fn parse_columns(configs: &[ColumnSpecConfig]) -> Result<Vec<ColumnSpec>> {
    configs.iter().cloned().map(ColumnSpec::try_from).collect()
}

/// One cell of a signature row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Count(u64),
    Number(f64),
    Days(Vec<i64>),
    /// Metadata needed for the column was absent.
    Missing,
}

/// Names of an outage/ticket label pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetColumns {
    pub outage: String,
    pub ticket: String,
}

impl Default for TargetColumns {
    fn default() -> Self {
        Self {
            outage: "OUTAGE".to_string(),
            ticket: "TICKET".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetLabel {
    pub outage_hours: Option<f64>,
    pub ticket_id: Option<String>,
}

impl TargetLabel {
    pub fn is_set(&self) -> bool {
        self.outage_hours.is_some()
    }
}

/// The y side of a signature row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureKey {
    pub feeder_id: String,
    pub timestamp: DateTime<Utc>,
    /// One label per registered target pair, in registration order.
    pub labels: Vec<TargetLabel>,
}

/// Paired feature matrix and keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureTable {
    pub columns: Vec<String>,
    pub targets: Vec<TargetColumns>,
    pub x: Vec<Vec<FeatureValue>>,
    pub y: Vec<SignatureKey>,
}

impl SignatureTable {
    pub fn new(columns: Vec<String>, targets: Vec<TargetColumns>) -> Self {
        Self {
            columns,
            targets,
            x: Vec::new(),
            y: Vec::new(),
        }
    }

    /// An empty table with the same schema.
    pub fn empty_like(&self) -> Self {
        Self::new(self.columns.clone(), self.targets.clone())
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn push(&mut self, key: SignatureKey, features: Vec<FeatureValue>) {
        self.y.push(key);
        self.x.push(features);
    }

    /// Append another table's rows. Schemas are assumed equal.
    pub fn extend(&mut self, other: SignatureTable) {
        self.x.extend(other.x);
        self.y.extend(other.y);
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn target_index(&self, target: &TargetColumns) -> Option<usize> {
        self.targets.iter().position(|t| t == target)
    }

    /// Index of `target`, registering it with empty labels if new.
    pub fn ensure_target(&mut self, target: &TargetColumns) -> usize {
        if let Some(idx) = self.target_index(target) {
            return idx;
        }
        self.targets.push(target.clone());
        for key in &mut self.y {
            key.labels.push(TargetLabel::default());
        }
        self.targets.len() - 1
    }

    /// Rows whose feeder satisfies `keep`, in order.
    pub fn select(&self, keep: impl Fn(&str) -> bool) -> SignatureTable {
        let mut out = self.empty_like();
        for (key, features) in self.y.iter().zip(&self.x) {
            if keep(&key.feeder_id) {
                out.push(key.clone(), features.clone());
            }
        }
        out
    }

    pub fn feeders(&self) -> HashSet<&str> {
        self.y.iter().map(|k| k.feeder_id.as_str()).collect()
    }

    /// Stable sort by (feeder, timestamp), keeping X and y paired.
    pub fn sort_canonical(&mut self) {
        let mut rows: Vec<(SignatureKey, Vec<FeatureValue>)> =
            self.y.drain(..).zip(self.x.drain(..)).collect();
        rows.sort_by(|(a, _), (b, _)| {
            a.feeder_id
                .cmp(&b.feeder_id)
                .then(a.timestamp.cmp(&b.timestamp))
        });
        for (key, features) in rows {
            self.push(key, features);
        }
    }
}
