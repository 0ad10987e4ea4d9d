//! TOML configuration for the extraction and signature pipeline.
//!
//! Layered like the rest of the tooling: an explicit `--config` path wins,
//! then the `GRIDPAM_CONFIG` environment variable, then
//! `/etc/gridpam/gridpam.toml`, then compiled-in defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classify::{Selection, TimeBounds};
use crate::signature::meta::DEFAULT_MIN_CUSTOMERS;
use crate::signature::{
    parse_columns, ColumnSpec, ColumnSpecConfig, TargetAssigner, TargetColumns,
};

pub const CONFIG_ENV: &str = "GRIDPAM_CONFIG";
const SYSTEM_CONFIG: &str = "/etc/gridpam/gridpam.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub feeders: FeederConfig,
    #[serde(default)]
    pub signatures: SignatureConfig,
    #[serde(default)]
    pub targets: TargetConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    /// Try `GRIDPAM_CONFIG`, then the system location, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "GRIDPAM_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit path must load; otherwise fall back through the layers.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn column_specs(&self) -> crate::error::Result<Vec<ColumnSpec>> {
        parse_columns(&self.signatures.columns)
    }

    /// Anomaly selection for a source, `default` when unset.
    pub fn selection(&self, source: &str) -> Selection {
        self.extract
            .anomalies
            .get(source)
            .map(|s| Selection::parse(s))
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Rolling window length for the continuous eDNA detectors.
    pub window_hours: f64,
    /// Per-source selection: `default`, `all`, or a comma separated list.
    pub anomalies: BTreeMap<String, String>,
    /// Earliest instant kept (RFC 3339 string).
    pub start: Option<DateTime<Utc>>,
    /// Latest instant kept; eDNA treats it as exclusive.
    pub end: Option<DateTime<Utc>>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            window_hours: 24.0,
            anomalies: BTreeMap::new(),
            start: None,
            end: None,
        }
    }
}

impl ExtractConfig {
    pub fn bounds(&self) -> TimeBounds {
        TimeBounds::new(self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Feeders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeederConfig {
    /// Feeders serving fewer customers are dropped before signatures.
    pub min_customers: f64,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            min_customers: DEFAULT_MIN_CUSTOMERS,
        }
    }
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Worker partitions; negative counts back from the core count.
    pub n_jobs: i64,
    /// Shuffle seed for partition contents.
    pub seed: Option<u64>,
    /// Raw anomaly name to the name columns look up.
    pub anomaly_map: BTreeMap<String, String>,
    pub columns: Vec<ColumnSpecConfig>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        let columns = vec![
            column("FAULT_CURRENT_24H", "FAULT_CURRENT", "trigger", 24.0, Some(true)),
            column("FAULT_ALARM_24H", "FAULT_ALARM", "background", 24.0, Some(false)),
            column("RELAY_TRIP_24H", "RELAY_TRIP", "flag", 24.0, Some(true)),
            column("BKR_OPEN_7D", "BKR_OPEN", "cluster", 168.0, Some(false)),
            column("LATERAL_OUTAGES_30D", "LATERAL_OUTAGES", "sequence", 720.0, Some(true)),
            column("ZERO_CURRENT_24H", "ZERO_CURRENT", "background", 24.0, Some(true)),
            column("TRIPLE_THREAT_24H", "", "special", 24.0, None),
            column("CUSTOMERS", "", "constant", 0.0, None),
        ];
        let anomaly_map = columns
            .iter()
            .filter(|c| !c.lookup.is_empty())
            .map(|c| (c.lookup.clone(), c.lookup.clone()))
            .collect();
        Self {
            n_jobs: 1,
            seed: None,
            anomaly_map,
            columns,
        }
    }
}

fn column(name: &str, lookup: &str, kind: &str, max_lag: f64, keep_all: Option<bool>) -> ColumnSpecConfig {
    ColumnSpecConfig {
        name: name.to_string(),
        lookup: lookup.to_string(),
        kind: kind.to_string(),
        min_lag_hours: 0.0,
        max_lag_hours: max_lag,
        keep_all,
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub lookahead_hours: f64,
    pub lookback_hours: f64,
    pub outage: String,
    pub ticket: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        let columns = TargetColumns::default();
        Self {
            lookahead_hours: 24.0,
            lookback_hours: 0.0,
            outage: columns.outage,
            ticket: columns.ticket,
        }
    }
}

impl TargetConfig {
    pub fn columns(&self) -> TargetColumns {
        TargetColumns {
            outage: self.outage.clone(),
            ticket: self.ticket.clone(),
        }
    }

    pub fn assigner(&self) -> TargetAssigner {
        TargetAssigner::new(self.lookahead_hours, self.lookback_hours, self.columns())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file outputs are also written to, when set.
    pub db_path: Option<PathBuf>,
    pub journal_mode: String,
    pub synchronous: String,
    /// How long a connection waits on a locked database.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            busy_timeout_ms: 5000,
        }
    }
}
