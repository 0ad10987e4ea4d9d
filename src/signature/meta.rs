//! Per-feeder metadata: customer counts, line lengths, and the constants and
//! reference dates used by constant and duration columns.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::table::{lenient_f64, lenient_string};

/// Feeders serving fewer customers than this are ignored by default.
pub const DEFAULT_MIN_CUSTOMERS: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeederMeta {
    #[serde(deserialize_with = "lenient_string")]
    pub feeder_id: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub customers: f64,
    /// Overhead line length.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub fdr_oh: f64,
    /// Underground line length.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub fdr_ug: f64,
    #[serde(default)]
    pub constants: BTreeMap<String, f64>,
    #[serde(default)]
    pub dates: BTreeMap<String, DateTime<Utc>>,
}

impl FeederMeta {
    pub fn new(feeder_id: &str, customers: f64, fdr_oh: f64, fdr_ug: f64) -> Self {
        Self {
            feeder_id: feeder_id.to_string(),
            customers,
            fdr_oh,
            fdr_ug,
            constants: BTreeMap::new(),
            dates: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeederTable {
    feeders: BTreeMap<String, FeederMeta>,
    min_customers: f64,
}

impl Default for FeederTable {
    fn default() -> Self {
        Self {
            feeders: BTreeMap::new(),
            min_customers: DEFAULT_MIN_CUSTOMERS,
        }
    }
}

impl FeederTable {
    /// Later rows for the same feeder replace earlier ones.
    pub fn new(rows: Vec<FeederMeta>) -> Self {
        Self {
            feeders: rows.into_iter().map(|m| (m.feeder_id.clone(), m)).collect(),
            min_customers: DEFAULT_MIN_CUSTOMERS,
        }
    }

    pub fn with_min_customers(mut self, min_customers: f64) -> Self {
        self.min_customers = min_customers;
        self
    }

    /// Load a JSON array of feeder rows.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feeder metadata: {}", path.display()))?;
        let rows: Vec<FeederMeta> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feeder metadata: {}", path.display()))?;
        tracing::debug!(path = %path.display(), feeders = rows.len(), "loaded feeder metadata");
        Ok(Self::new(rows))
    }

    pub fn len(&self) -> usize {
        self.feeders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeders.is_empty()
    }

    pub fn get(&self, feeder_id: &str) -> Option<&FeederMeta> {
        self.feeders.get(feeder_id)
    }

    /// Low-customer feeders and feeders with no line length at all.
    pub fn is_ignored(&self, feeder_id: &str) -> bool {
        match self.feeders.get(feeder_id) {
            Some(m) => m.customers < self.min_customers || (m.fdr_oh == 0.0 && m.fdr_ug == 0.0),
            None => false,
        }
    }

    pub fn ignored(&self) -> BTreeSet<&str> {
        self.feeders
            .keys()
            .filter(|f| self.is_ignored(f))
            .map(String::as_str)
            .collect()
    }

    /// Known and not ignored.
    pub fn is_usable(&self, feeder_id: &str) -> bool {
        self.feeders.contains_key(feeder_id) && !self.is_ignored(feeder_id)
    }

    pub fn customer_counts(&self) -> HashMap<String, u64> {
        self.feeders
            .values()
            .map(|m| (m.feeder_id.clone(), m.customers.max(0.0) as u64))
            .collect()
    }
}
