//! Continuous telemetry rules: discrete sensor alarms plus the rolling window
//! detectors run per point.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Classifier, Selection};
use crate::anomaly::{AnomalyBuilder, AnomalyRecord, Device, NOT_APPLICABLE, UNKNOWN};
use crate::detect::engine::Method;
use crate::detect::{RollingWindowDetector, Sample, SignalKind};
use crate::error::Result;
use crate::table::{lenient_f64, lenient_string, EventTable};

const SOURCE: &str = "edna";

pub const COLUMNS: &[&str] = &["point", "value", "value_text", "time", "status"];

pub const ANOMALIES: &[&str] = &[
    "FCI_FAULT_ALARM",
    "FCI_I_FAULT_FULL",
    "FCI_I_FAULT_TEMP",
    "AFS_ALARM_ALARM",
    "AFS_GROUND_ALARM",
    "AFS_I_FAULT_FULL",
    "AFS_I_FAULT_TEMP",
    "ZERO_CURRENT_V3",
    "ZERO_CURRENT_V4",
    "ZERO_POWER_V3",
    "ZERO_POWER_V4",
    "ZERO_VOLTAGE_V3",
    "ZERO_VOLTAGE_V4",
    "PF_SPIKES_V3",
    "THD_SPIKES_V3",
];

const DEFAULT: &[&str] = &[
    "FCI_FAULT_ALARM",
    "FCI_I_FAULT_FULL",
    "FCI_I_FAULT_TEMP",
    "AFS_ALARM_ALARM",
    "AFS_GROUND_ALARM",
    "AFS_I_FAULT_FULL",
    "AFS_I_FAULT_TEMP",
    "ZERO_CURRENT_V4",
    "ZERO_POWER_V4",
    "ZERO_VOLTAGE_V4",
    "PF_SPIKES_V3",
    "THD_SPIKES_V3",
];

const FAULT_MIN_AMPS: f64 = 600.0;
const FULL_FAULT_AMPS: f64 = 900.0;

static FEEDER_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"[\._][0-9]{6}[\._]").ok());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointSample {
    #[serde(deserialize_with = "lenient_string")]
    pub point: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub value: f64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub value_text: String,
    pub time: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: String,
}

/// Which family of points a continuous detector reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PointClass {
    PhaseCurrent,
    PhaseVoltage,
    FeederPower,
    PowerFactor,
    HarmonicCurrent,
}

impl PointClass {
    fn matches(self, point: &str) -> bool {
        let feeder_level = point.contains(".FDR.") && !point.contains("BKR.");
        let phased = feeder_level && point.contains("_PH");
        match self {
            PointClass::PhaseCurrent => phased && point.contains(".I."),
            PointClass::PhaseVoltage => phased && point.contains(".V."),
            PointClass::FeederPower => feeder_level && point.contains(".MW"),
            PointClass::PowerFactor => phased && point.contains(".PF."),
            PointClass::HarmonicCurrent => point.contains(".THD_") && point.contains("urrent"),
        }
    }
}

const CONTINUOUS: &[(&str, PointClass, Method)] = &[
    (
        "ZERO_CURRENT_V3",
        PointClass::PhaseCurrent,
        Method::QuantileV3(SignalKind::Current),
    ),
    (
        "ZERO_CURRENT_V4",
        PointClass::PhaseCurrent,
        Method::HysteresisV4(SignalKind::Current),
    ),
    (
        "PF_SPIKES_V3",
        PointClass::PowerFactor,
        Method::QuantileV3(SignalKind::PowerFactor),
    ),
    (
        "ZERO_POWER_V3",
        PointClass::FeederPower,
        Method::QuantileV3(SignalKind::Power),
    ),
    (
        "ZERO_POWER_V4",
        PointClass::FeederPower,
        Method::HysteresisV4(SignalKind::Power),
    ),
    ("THD_SPIKES_V3", PointClass::HarmonicCurrent, Method::Spike),
    (
        "ZERO_VOLTAGE_V3",
        PointClass::PhaseVoltage,
        Method::QuantileV3(SignalKind::Voltage),
    ),
    (
        "ZERO_VOLTAGE_V4",
        PointClass::PhaseVoltage,
        Method::HysteresisV4(SignalKind::Voltage),
    ),
];

/// Feeder id embedded in a point name.
pub fn feeder_of(point: &str) -> Option<String> {
    let pattern = (*FEEDER_PATTERN).as_ref()?;
    let m = pattern.find(point)?;
    m.as_str().get(1..7).map(str::to_string)
}

/// Device attributes encoded in a point name.
pub fn device_of(point: &str) -> Device {
    let phaser = point.contains(".FDR") && !point.contains("BKR.");
    let (kind, id) = if point.contains(".FCI.") {
        ("FCI", point.split('.').nth(3))
    } else if point.contains(".AFS.") {
        ("AFS", point.split('.').nth(3))
    } else if phaser {
        (
            "PHASER",
            point.split('.').nth(2).and_then(|seg| seg.split('_').nth(1)),
        )
    } else {
        (UNKNOWN, None)
    };

    let phase = if point.contains("_PH") {
        let chars: Vec<char> = point.chars().collect();
        match chars.len().checked_sub(4) {
            Some(i) => chars[i].to_string(),
            None => UNKNOWN.to_string(),
        }
    } else {
        NOT_APPLICABLE.to_string()
    };

    Device::new(kind, id.unwrap_or(UNKNOWN), phase)
}

pub struct EdnaClassifier {
    detector: RollingWindowDetector,
}

impl Default for EdnaClassifier {
    fn default() -> Self {
        Self::new(RollingWindowDetector::default())
    }
}

impl EdnaClassifier {
    pub fn new(detector: RollingWindowDetector) -> Self {
        Self { detector }
    }
}

impl Classifier for EdnaClassifier {
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

    /// Detectors run over the full history; only their output is bounded,
    /// and the end is exclusive.
    fn end_inclusive(&self) -> bool {
        false
    }

    fn feeders(&self, table: &EventTable) -> Result<BTreeSet<String>> {
        let rows: Vec<PointSample> = table.decode(SOURCE, COLUMNS)?;
        Ok(rows
            .iter()
            .filter(|r| !r.point.contains("Bad point"))
            .filter_map(|r| feeder_of(&r.point))
            .collect())
    }

    fn extract(
        &self,
        table: &EventTable,
        feeder_id: &str,
        selection: &Selection,
    ) -> Result<Vec<AnomalyRecord>> {
        let selected = selection.resolve(SOURCE, ANOMALIES, DEFAULT)?;
        let all: Vec<PointSample> = table.decode(SOURCE, COLUMNS)?;

        let mut seen = HashSet::new();
        let rows: Vec<&PointSample> = all
            .iter()
            .filter(|r| !r.point.contains("Bad point"))
            .filter(|r| feeder_of(&r.point).as_deref() == Some(feeder_id))
            .filter(|r| {
                seen.insert((
                    r.point.as_str(),
                    r.value.to_bits(),
                    r.value_text.as_str(),
                    r.time,
                    r.status.as_str(),
                ))
            })
            .collect();

        let mut pass = AnomalyBuilder::new(feeder_id);

        if selected.contains("FCI_FAULT_ALARM") {
            pass.merge(alarms(feeder_id, &rows, "FCI_FAULT_ALARM", |r| {
                r.point.contains(".FCI.") && r.point.contains(".FAULT") && r.value_text != "NORMAL"
            }));
        }
        if selected.any(&["FCI_I_FAULT_FULL", "FCI_I_FAULT_TEMP"]) {
            pass.merge(fault_magnitudes(feeder_id, &rows, ".FCI.", "FCI", &selected));
        }
        if selected.contains("AFS_ALARM_ALARM") {
            pass.merge(alarms(feeder_id, &rows, "AFS_ALARM_ALARM", |r| {
                r.point.contains(".AFS.") && r.point.contains(".ALARM") && r.value_text == "ALARM"
            }));
        }
        if selected.contains("AFS_GROUND_ALARM") {
            pass.merge(alarms(feeder_id, &rows, "AFS_GROUND_ALARM", |r| {
                r.point.contains(".AFS.") && r.point.contains(".GROUND") && r.value_text == "ALARM"
            }));
        }
        if selected.any(&["AFS_I_FAULT_FULL", "AFS_I_FAULT_TEMP"]) {
            pass.merge(fault_magnitudes(feeder_id, &rows, ".AFS.", "AFS", &selected));
        }

        // Only healthy readings feed the continuous detectors.
        let mut series: BTreeMap<&str, Vec<Sample>> = BTreeMap::new();
        for r in rows.iter().filter(|r| r.status == "OK") {
            series
                .entry(r.point.as_str())
                .or_default()
                .push(Sample::new(r.time, r.value));
        }
        for samples in series.values_mut() {
            samples.sort_by_key(|s| s.time);
        }

        for &(name, class, method) in CONTINUOUS {
            if !selected.contains(name) {
                continue;
            }
            let points: BTreeMap<String, Vec<Sample>> = series
                .iter()
                .filter(|(point, _)| class.matches(point))
                .map(|(point, samples)| (point.to_string(), samples.clone()))
                .collect();
            let mut step = AnomalyBuilder::new(feeder_id);
            for (point, flagged) in self.detector.run_points(method, &points) {
                let samples = &points[point];
                let device = device_of(point);
                for idx in flagged {
                    step.push(name, samples[idx].time, point, device.clone());
                }
            }
            debug!(feeder = %feeder_id, anomaly = name, points = points.len(), found = step.len(), "detector pass");
            pass.merge(step);
        }

        Ok(pass.finish())
    }
}

fn alarms(
    feeder_id: &str,
    rows: &[&PointSample],
    name: &str,
    matches: impl Fn(&PointSample) -> bool,
) -> AnomalyBuilder {
    let mut step = AnomalyBuilder::new(feeder_id);
    for r in rows.iter().filter(|r| matches(**r)) {
        step.push(name, r.time, r.point.as_str(), device_of(&r.point));
    }
    step
}

fn fault_magnitudes(
    feeder_id: &str,
    rows: &[&PointSample],
    marker: &str,
    prefix: &str,
    selected: &super::Selected,
) -> AnomalyBuilder {
    let mut step = AnomalyBuilder::new(feeder_id);
    let full = format!("{prefix}_I_FAULT_FULL");
    let temp = format!("{prefix}_I_FAULT_TEMP");
    for r in rows
        .iter()
        .filter(|r| r.point.contains(marker) && r.point.contains(".I_FAULT"))
        .filter(|r| r.value >= FAULT_MIN_AMPS)
    {
        let name = if r.value >= FULL_FAULT_AMPS { &full } else { &temp };
        if selected.contains(name) {
            step.push(name, r.time, r.point.as_str(), device_of(&r.point));
        }
    }
    step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{extract_feeders, TimeBounds};
    use chrono::{Duration, TimeZone};

    const CURRENT: &str = "DIST.FDR.P_402233_1.I.AVG.A_PH";
    const FCI: &str = "DIST.402233.FCI.F17.FAULT";
    const FCI_AMPS: &str = "DIST.402233.FCI.F17.I_FAULT";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 2, 1, 0, 0, 0).unwrap()
    }

    fn sample(point: &str, minutes: i64, value: f64, text: &str, status: &str) -> PointSample {
        PointSample {
            point: point.to_string(),
            value,
            value_text: text.to_string(),
            time: t0() + Duration::minutes(minutes),
            status: status.to_string(),
        }
    }

    #[test]
    fn test_point_parsing() {
        assert_eq!(feeder_of(CURRENT).as_deref(), Some("402233"));
        assert_eq!(feeder_of("DIST.40223.FCI"), None);

        let phaser = device_of(CURRENT);
        assert_eq!(phaser, Device::new("PHASER", "402233", "A"));

        let fci = device_of(FCI);
        assert_eq!(fci, Device::new("FCI", "F17", "-"));

        assert_eq!(device_of("X.402233.BKR.MW").kind, UNKNOWN);
    }

    #[test]
    fn test_discrete_alarms_and_faults() {
        let rows = vec![
            sample(FCI, 0, 0.0, "FAULT", "SET"),
            sample(FCI, 1, 0.0, "NORMAL", "SET"),
            sample(FCI_AMPS, 2, 950.0, "", "SET"),
            sample(FCI_AMPS, 3, 650.0, "", "SET"),
            sample(FCI_AMPS, 4, 599.0, "", "SET"),
            sample("DIST.999999.FCI.F1.FAULT", 5, 0.0, "FAULT", "SET"),
            sample("Bad point DIST.402233.FCI.F9.FAULT", 6, 0.0, "FAULT", "SET"),
        ];
        let table = EventTable::from_rows(COLUMNS, &rows);
        let out = EdnaClassifier::default()
            .extract(&table, "402233", &Selection::Default)
            .unwrap();
        let names: Vec<&str> = out.iter().map(|r| r.anomaly_type.as_str()).collect();
        assert_eq!(names, vec!["FCI_FAULT_ALARM", "FCI_I_FAULT_FULL", "FCI_I_FAULT_TEMP"]);
        assert_eq!(out[0].source_signal, FCI);
    }

    #[test]
    fn test_current_drop_detected_per_point() {
        let mut rows: Vec<PointSample> = (0..60)
            .map(|i| sample(CURRENT, 30 * i, 80.0, "", "OK"))
            .collect();
        rows.push(sample(CURRENT, 30 * 60, 0.0, "", "OK"));
        // an unhealthy reading never reaches the detector
        rows.push(sample(CURRENT, 30 * 61, 80.0, "", "BAD"));
        let table = EventTable::from_rows(COLUMNS, &rows);
        let out = EdnaClassifier::default()
            .extract(&table, "402233", &Selection::Named(vec!["ZERO_CURRENT_V4".into()]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].anomaly_type, "ZERO_CURRENT_V4");
        assert_eq!(out[0].timestamp, t0() + Duration::minutes(30 * 60));
        assert_eq!(out[0].device_type, "PHASER");
        assert_eq!(out[0].device_phase, "A");
    }

    #[test]
    fn test_bounds_apply_to_output_with_exclusive_end() {
        let mut rows: Vec<PointSample> = (0..60)
            .map(|i| sample(CURRENT, 30 * i, 80.0, "", "OK"))
            .collect();
        rows.push(sample(CURRENT, 30 * 60, 0.0, "", "OK"));
        rows.push(sample(FCI, 30 * 61, 0.0, "FAULT", "SET"));
        let table = EventTable::from_rows(COLUMNS, &rows);
        let classifier = EdnaClassifier::default();
        let feeders = classifier.feeders(&table).unwrap();
        let selection = Selection::Named(vec!["ZERO_CURRENT_V4".into(), "FCI_FAULT_ALARM".into()]);

        // the window starts at the drop, yet the detector still sees the history
        let bounds = TimeBounds::new(
            Some(t0() + Duration::minutes(30 * 60)),
            Some(t0() + Duration::minutes(30 * 61)),
        );
        let store = extract_feeders(&classifier, &table, &feeders, &selection, &bounds).unwrap();
        let names: Vec<&str> = store.records().iter().map(|r| r.anomaly_type.as_str()).collect();
        assert_eq!(names, vec!["ZERO_CURRENT_V4"]);
    }

    #[test]
    fn test_sparse_points_are_skipped() {
        let rows: Vec<PointSample> = (0..10)
            .map(|i| sample(CURRENT, 30 * i, if i == 9 { 0.0 } else { 80.0 }, "", "OK"))
            .collect();
        let table = EventTable::from_rows(COLUMNS, &rows);
        let out = EdnaClassifier::default()
            .extract(&table, "402233", &Selection::All)
            .unwrap();
        assert!(out.is_empty());
    }
}
