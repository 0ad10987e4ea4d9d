//! Windowed anomaly detection for continuous telemetry points.

pub mod engine;
pub mod window;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use engine::RollingWindowDetector;

/// One reading of a continuous signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(time: DateTime<Utc>, value: f64) -> Self {
        Self { time, value }
    }
}

/// Outcome of running a detector over one point's series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// The series spans less than an hour or has fewer than 24 rows; nothing
    /// was evaluated.
    TooSparse,
    /// Indices (into the input series) of the retained anomalous samples.
    Flagged(Vec<usize>),
}

impl Detection {
    pub fn indices(&self) -> &[usize] {
        match self {
            Detection::TooSparse => &[],
            Detection::Flagged(idx) => idx,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Detection::TooSparse)
    }
}

/// Physical quantity measured by a point. Each has its own near-zero band
/// and quantile threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Current,
    Power,
    Voltage,
    PowerFactor,
}

impl SignalKind {
    /// Exclusive `(low, high)` bounds of the "dropped to zero" band.
    pub fn band(self) -> (f64, f64) {
        match self {
            SignalKind::Current => (-0.5, 1.0),
            SignalKind::Power => (-0.5, 0.1),
            SignalKind::Voltage => (-0.5, 1.0),
            // compared against |value|
            SignalKind::PowerFactor => (f64::NEG_INFINITY, 0.75),
        }
    }

    /// The trailing 1st percentile must exceed this for a V3 flag.
    pub fn quantile_threshold(self) -> f64 {
        match self {
            SignalKind::Current => 10.0,
            SignalKind::Power => 0.5,
            SignalKind::Voltage => 90.0,
            SignalKind::PowerFactor => 0.8,
        }
    }

    /// Power factor is judged on magnitude; the sign only encodes lead/lag.
    pub fn uses_magnitude(self) -> bool {
        matches!(self, SignalKind::PowerFactor)
    }

    pub fn in_band(self, value: f64) -> bool {
        let (low, high) = self.band();
        value > low && value < high
    }

    /// At or above the band: the signal is considered healthy.
    pub fn is_okay(self, value: f64) -> bool {
        value >= self.band().1
    }
}
