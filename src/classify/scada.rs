//! Switchgear alarm log rules.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{char_at, contains_all, contains_none, token, Classifier, Selected, Selection};
use crate::anomaly::{AnomalyBuilder, AnomalyRecord, Device, UNKNOWN};
use crate::error::Result;
use crate::table::{lenient_string, EventTable};

const SOURCE: &str = "scada";

pub const COLUMNS: &[&str] = &["feeder", "text", "time"];

pub const ANOMALIES: &[&str] = &[
    "BKR_OPEN",
    "BKR_CLOSE",
    "BKR_FAIL_TO_OPR",
    "FC_NO_BO",
    "FAULT_ALARM",
    "FAULT_CURRENT",
    "TEMP_FAULT_CURRENT",
    "CURRENT_LIMIT",
    "FDRHD_ENERGIZED",
    "FDRHD_DE_ENERGIZED",
    "HIGH_VOLTAGE",
    "INTELI_PH_ALARM",
    "INTELI_OPS_DSW_OPEN",
    "INTELI_OPS_DSW_CLOSE",
    "REGULATOR_BLOCK",
    "RELAY_ALARM",
    "RELAY_TRIP",
    "VOLTAGE_DROP",
];

/// Faults at or above this many amps are full faults.
const FULL_FAULT_AMPS: f64 = 900.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScadaEvent {
    #[serde(deserialize_with = "lenient_string")]
    pub feeder: String,
    #[serde(deserialize_with = "lenient_string")]
    pub text: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScadaClassifier;

impl Classifier for ScadaClassifier {
    fn source(&self) -> &'static str {
        SOURCE
    }

    fn all_anomalies(&self) -> &'static [&'static str] {
        ANOMALIES
    }

    fn default_anomalies(&self) -> &'static [&'static str] {
        ANOMALIES
    }

    fn required_columns(&self) -> &'static [&'static str] {
        COLUMNS
    }

    fn row_time_column(&self) -> Option<&'static str> {
        Some("time")
    }

    fn feeders(&self, table: &EventTable) -> Result<BTreeSet<String>> {
        let events: Vec<ScadaEvent> = table.decode(SOURCE, COLUMNS)?;
        Ok(events.into_iter().map(|e| e.feeder).collect())
    }

    fn extract(
        &self,
        table: &EventTable,
        feeder_id: &str,
        selection: &Selection,
    ) -> Result<Vec<AnomalyRecord>> {
        let selected = selection.resolve(SOURCE, ANOMALIES, ANOMALIES)?;
        let events: Vec<ScadaEvent> = table.decode(SOURCE, COLUMNS)?;

        let mut seen = HashSet::new();
        let events: Vec<&ScadaEvent> = events
            .iter()
            .filter(|e| e.feeder == feeder_id)
            .filter(|e| seen.insert((e.text.as_str(), e.time)))
            .collect();

        let mut pass = AnomalyBuilder::new(feeder_id);
        let mut breaker_opens = Vec::new();
        let mut full_faults = Vec::new();

        if selected.any(&["BKR_OPEN", "BKR_CLOSE", "BKR_FAIL_TO_OPR", "FC_NO_BO"]) {
            pass.merge(breakers(feeder_id, &events, &selected, &mut breaker_opens));
        }
        if selected.contains("FAULT_ALARM") {
            pass.merge(fault_alarms(feeder_id, &events));
        }
        if selected.any(&["FAULT_CURRENT", "TEMP_FAULT_CURRENT", "FC_NO_BO"]) {
            pass.merge(fault_currents(feeder_id, &events, &selected, &mut full_faults));
        }
        if selected.contains("FC_NO_BO") {
            pass.merge(faults_without_breaker(feeder_id, &full_faults, &breaker_opens));
        }
        if selected.contains("CURRENT_LIMIT") {
            pass.merge(simple(feeder_id, &events, "CURRENT_LIMIT", first_phase, |t| {
                t.contains("AMP LIM-1 HIGH")
            }));
        }
        for (name, marker) in [
            ("FDRHD_ENERGIZED", "ENGZ ENERGIZED"),
            ("FDRHD_DE_ENERGIZED", "ENGZ DE-ENERGIZED"),
        ] {
            if selected.contains(name) {
                pass.merge(simple(feeder_id, &events, name, no_phase, |t| {
                    contains_all(t, &[" FDRHD ", marker])
                }));
            }
        }
        if selected.contains("HIGH_VOLTAGE") {
            pass.merge(high_voltage(feeder_id, &events));
        }
        if selected.contains("INTELI_PH_ALARM") {
            pass.merge(simple(feeder_id, &events, "INTELI_PH_ALARM", first_phase, |t| {
                contains_all(t, &[" INTELI ", "PH ALARM"])
            }));
        }
        for (name, state) in [("INTELI_OPS_DSW_OPEN", "OPEN"), ("INTELI_OPS_DSW_CLOSE", "CLOSE")] {
            if selected.contains(name) {
                pass.merge(simple(feeder_id, &events, name, switch_phase, |t| {
                    contains_all(t, &[" INTELI ", "DSW", state])
                        && contains_none(
                            t,
                            &["MAINT", "CTRL", "DEFINITION", "STATUS", "ABLED", "INHIBITED"],
                        )
                }));
            }
        }
        if selected.contains("REGULATOR_BLOCK") {
            pass.merge(simple(feeder_id, &events, "REGULATOR_BLOCK", no_phase, |t| {
                contains_all(t, &[" FDRHD ", " REGU ", "BLOCK"])
                    && contains_none(t, &[" NORMAL", " STATUS ", " CTRL "])
            }));
        }
        for (name, marker) in [("RELAY_ALARM", "ALARM"), ("RELAY_TRIP", "TRIP")] {
            if selected.contains(name) {
                pass.merge(simple(feeder_id, &events, name, no_phase, |t| {
                    contains_all(t, &[" RELAY ", marker]) && contains_none(t, &["NORMAL", "STATUS"])
                }));
            }
        }
        if selected.contains("VOLTAGE_DROP") {
            pass.merge(simple(feeder_id, &events, "VOLTAGE_DROP", voltage_phase, |t| {
                t.contains("FORBDN")
            }));
        }

        Ok(pass.finish())
    }
}

fn device(text: &str, phase: String) -> Device {
    Device::new(token(text, 1), token(text, 2), phase)
}

fn no_phase(_: &str) -> String {
    "-".to_string()
}

fn first_phase(text: &str) -> String {
    char_at(token(text, 3), 0)
}

fn voltage_phase(text: &str) -> String {
    let tok = token(text, 3);
    if tok.starts_with('L') {
        char_at(tok, 1)
    } else {
        char_at(tok, 0)
    }
}

/// Disconnect switch tokens carry the phase as their fourth character.
fn switch_phase(text: &str) -> String {
    let tok = token(text, 3);
    if tok.chars().count() == 4 {
        char_at(tok, 3)
    } else {
        "-".to_string()
    }
}

/// One name per matching row with the given phase rule.
fn simple(
    feeder_id: &str,
    events: &[&ScadaEvent],
    name: &str,
    phase: fn(&str) -> String,
    matches: impl Fn(&str) -> bool,
) -> AnomalyBuilder {
    let mut step = AnomalyBuilder::new(feeder_id);
    for e in events.iter().filter(|e| matches(e.text.as_str())) {
        step.push(name, e.time, e.text.as_str(), device(&e.text, phase(e.text.as_str())));
    }
    step
}

fn breaker_state(text: &str) -> String {
    match text.split(' ').nth(4) {
        Some(tok) => tok.replace('D', "").replace('-', "_"),
        None => UNKNOWN.to_string(),
    }
}

fn breakers(
    feeder_id: &str,
    events: &[&ScadaEvent],
    selected: &Selected,
    opens: &mut Vec<DateTime<Utc>>,
) -> AnomalyBuilder {
    let mut step = AnomalyBuilder::new(feeder_id);
    let candidates = events.iter().filter(|e| {
        contains_all(&e.text, &["FEED", "BKR"])
            && contains_none(
                &e.text,
                &[
                    "Composite",
                    "STATUS",
                    "DEFINITION",
                    "CTRL",
                    "OVERRIDDEN",
                    "has experienced",
                    "Comments:",
                    "ISD POINT",
                    "operation",
                ],
            )
    });
    for e in candidates {
        for name in breaker_names(&breaker_state(&e.text)) {
            if name == "BKR_OPEN" {
                opens.push(e.time);
            }
            if selected.contains(name) {
                step.push(name, e.time, e.text.as_str(), device(&e.text, no_phase(&e.text)));
            }
        }
    }
    step
}

/// Names for one breaker state. The two reclose sequences collapse to a
/// single name; any other state gets one name per substring it carries.
fn breaker_names(state: &str) -> Vec<&'static str> {
    match state {
        "OPEN_CLOSE_OPEN" => vec!["BKR_OPEN"],
        "CLOSE_OPEN_CLOSE" => vec!["BKR_CLOSE"],
        "FAIL_TO_OPR" => vec!["BKR_FAIL_TO_OPR"],
        s => {
            let mut names = Vec::new();
            if s.contains("OPEN") {
                names.push("BKR_OPEN");
            }
            if s.contains("CLOSE") {
                names.push("BKR_CLOSE");
            }
            names
        }
    }
}

fn fault_alarms(feeder_id: &str, events: &[&ScadaEvent]) -> AnomalyBuilder {
    simple(feeder_id, events, "FAULT_ALARM", first_phase, |t| {
        contains_all(t, &[" FAULT ", " ALARM"]) && contains_none(t, &[" ANALOG ", " STATUS "])
    })
}

fn fault_magnitude(text: &str) -> f64 {
    text.split(' ')
        .nth(5)
        .and_then(|tok| tok.parse().ok())
        .unwrap_or(0.0)
}

fn fault_currents(
    feeder_id: &str,
    events: &[&ScadaEvent],
    selected: &Selected,
    full: &mut Vec<DateTime<Utc>>,
) -> AnomalyBuilder {
    let mut step = AnomalyBuilder::new(feeder_id);
    for e in events.iter().filter(|e| e.text.contains("LIM-HIGH")) {
        let amps = fault_magnitude(&e.text);
        if !(amps > 1.0) {
            continue;
        }
        let name = if amps >= FULL_FAULT_AMPS {
            full.push(e.time);
            "FAULT_CURRENT"
        } else {
            "TEMP_FAULT_CURRENT"
        };
        if !selected.contains(name) {
            continue;
        }
        let tok = token(&e.text, 3);
        let phase = if tok == "FAMP" {
            "-".to_string()
        } else {
            char_at(tok, 1)
        };
        step.push(name, e.time, e.text.as_str(), device(&e.text, phase));
    }
    step
}

/// Full faults with no breaker opening in `[f - 1min, f + 2min)`.
fn faults_without_breaker(
    feeder_id: &str,
    faults: &[DateTime<Utc>],
    opens: &[DateTime<Utc>],
) -> AnomalyBuilder {
    let mut step = AnomalyBuilder::new(feeder_id);
    for &f in faults {
        let start = f - Duration::minutes(1);
        let end = f + Duration::minutes(2);
        if !opens.iter().any(|&o| o >= start && o < end) {
            step.push("FC_NO_BO", f, "-", Device::none());
        }
    }
    step
}

fn voltage_magnitude(text: &str) -> f64 {
    text.split(' ')
        .nth(6)
        .and_then(|tok| tok.parse().ok())
        .unwrap_or(0.0)
}

fn high_voltage(feeder_id: &str, events: &[&ScadaEvent]) -> AnomalyBuilder {
    let mut step = AnomalyBuilder::new(feeder_id);
    for e in events.iter() {
        let t = e.text.as_str();
        let is_limit = (t.contains("VLT LIM") || t.contains("VT LIM"))
            && t.contains("HIGH")
            && contains_none(t, &[" LOW ", "LIMIT"]);
        if !is_limit {
            continue;
        }
        let volts = voltage_magnitude(t);
        if (130.0..1000.0).contains(&volts) {
            step.push("HIGH_VOLTAGE", e.time, t, device(t, voltage_phase(t)));
        }
    }
    step
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FEEDER: &str = "505963";

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 7, 14, h, m, s).unwrap()
    }

    fn table(rows: &[(&str, &str, DateTime<Utc>)]) -> EventTable {
        let events: Vec<ScadaEvent> = rows
            .iter()
            .map(|(feeder, text, time)| ScadaEvent {
                feeder: feeder.to_string(),
                text: text.to_string(),
                time: *time,
            })
            .collect();
        EventTable::from_rows(COLUMNS, &events)
    }

    fn names(records: &[AnomalyRecord]) -> Vec<&str> {
        records.iter().map(|r| r.anomaly_type.as_str()).collect()
    }

    fn run(table: &EventTable, sel: Selection) -> Vec<AnomalyRecord> {
        ScadaClassifier.extract(table, FEEDER, &sel).unwrap()
    }

    #[test]
    fn test_breaker_sequences() {
        let t = table(&[
            (FEEDER, "ALM FEED BKR-1234 3P OPEN-CLOSE-OPEN", at(1, 0, 0)),
            (FEEDER, "ALM FEED BKR-1234 3P CLOSE-OPEN-CLOSE", at(1, 5, 0)),
            (FEEDER, "ALM FEED BKR-1234 3P CLOSED", at(1, 10, 0)),
            (FEEDER, "ALM FEED BKR-1234 3P FAIL-TO-OPR", at(1, 15, 0)),
            (FEEDER, "ALM FEED BKR-1234 STATUS OPEN", at(1, 20, 0)),
        ]);
        let sel = Selection::Named(vec![
            "BKR_OPEN".into(),
            "BKR_CLOSE".into(),
            "BKR_FAIL_TO_OPR".into(),
        ]);
        let out = run(&t, sel);
        assert_eq!(names(&out), vec!["BKR_OPEN", "BKR_CLOSE", "BKR_CLOSE", "BKR_FAIL_TO_OPR"]);
        assert_eq!(out[0].device_type, "FEED");
        assert_eq!(out[0].device_id, "BKR-1234");
        assert_eq!(out[0].device_phase, "-");
    }

    #[test]
    fn test_mixed_breaker_state_yields_both() {
        let t = table(&[
            (FEEDER, "ALM FEED BKR-1234 3P OPEN-CLOSE", at(1, 0, 0)),
            (FEEDER, "ALM FEED BKR-1234 3P OPEN-CLOSE-OPEN", at(1, 5, 0)),
        ]);
        let sel = Selection::Named(vec!["BKR_OPEN".into(), "BKR_CLOSE".into()]);
        let out = run(&t, sel);
        assert_eq!(names(&out), vec!["BKR_OPEN", "BKR_CLOSE", "BKR_OPEN"]);
        assert!(out[..2].iter().all(|r| r.timestamp == at(1, 0, 0)));
        assert_eq!(breaker_names("CLOSE_OPEN"), vec!["BKR_OPEN", "BKR_CLOSE"]);
        assert!(breaker_names("UNKNOWN").is_empty());
    }

    #[test]
    fn test_fault_current_thresholds() {
        let t = table(&[
            (FEEDER, "X FDRHD 1234 IA LIM-HIGH 900", at(2, 0, 0)),
            (FEEDER, "X FDRHD 1234 IB LIM-HIGH 899.999", at(2, 1, 0)),
            (FEEDER, "X FDRHD 1234 IC LIM-HIGH 1", at(2, 2, 0)),
            (FEEDER, "X FDRHD 1234 FAMP LIM-HIGH garbage", at(2, 3, 0)),
            (FEEDER, "X FDRHD 1234 FAMP LIM-HIGH 1200", at(2, 4, 0)),
        ]);
        let sel = Selection::Named(vec!["FAULT_CURRENT".into(), "TEMP_FAULT_CURRENT".into()]);
        let out = run(&t, sel);
        assert_eq!(names(&out), vec!["FAULT_CURRENT", "TEMP_FAULT_CURRENT", "FAULT_CURRENT"]);
        assert_eq!(out[0].device_phase, "A");
        assert_eq!(out[1].device_phase, "B");
        assert_eq!(out[2].device_phase, "-");
    }

    #[test]
    fn test_fault_without_breaker_window() {
        let fault = (FEEDER, "X FDRHD 1234 IA LIM-HIGH 950", at(3, 0, 0));
        let sel = || Selection::Named(vec!["FC_NO_BO".into()]);

        // breaker opens 90s after the fault: covered
        let covered = table(&[fault, (FEEDER, "ALM FEED BKR-1 3P OPEN", at(3, 1, 30))]);
        assert!(run(&covered, sel()).is_empty());

        // one minute before is still inside the window
        let early = table(&[fault, (FEEDER, "ALM FEED BKR-1 3P OPEN", at(2, 59, 0))]);
        assert!(run(&early, sel()).is_empty());

        // two minutes after is outside
        let late = table(&[fault, (FEEDER, "ALM FEED BKR-1 3P OPEN", at(3, 2, 0))]);
        let out = run(&late, sel());
        assert_eq!(names(&out), vec!["FC_NO_BO"]);
        assert_eq!(out[0].timestamp, at(3, 0, 0));
        assert_eq!(out[0].source_signal, "-");
        assert_eq!(out[0].device_type, "-");
    }

    #[test]
    fn test_other_feeders_ignored() {
        let t = table(&[
            ("999999", "X FDRHD 1234 IA LIM-HIGH 950", at(4, 0, 0)),
            (FEEDER, "X FDRHD 1234 IA LIM-HIGH 950", at(4, 0, 0)),
            (FEEDER, "X FDRHD 1234 IA LIM-HIGH 950", at(4, 0, 0)),
        ]);
        let out = run(&t, Selection::Named(vec!["FAULT_CURRENT".into()]));
        assert_eq!(out.len(), 1);
        assert!(out.iter().all(|r| r.feeder_id == FEEDER));
    }

    #[test]
    fn test_voltage_and_switch_phases() {
        let t = table(&[
            (FEEDER, "X FDRHD 1234 LB VLT LIM 131.5 HIGH", at(5, 0, 0)),
            (FEEDER, "X FDRHD 1234 C VLT LIM 129.0 HIGH", at(5, 1, 0)),
            (FEEDER, "X INTELI 77 DSWC OPEN", at(5, 2, 0)),
            (FEEDER, "X INTELI 77 DSW CLOSE", at(5, 3, 0)),
        ]);
        let sel = Selection::Named(vec![
            "HIGH_VOLTAGE".into(),
            "INTELI_OPS_DSW_OPEN".into(),
            "INTELI_OPS_DSW_CLOSE".into(),
        ]);
        let out = run(&t, sel);
        assert_eq!(
            names(&out),
            vec!["HIGH_VOLTAGE", "INTELI_OPS_DSW_OPEN", "INTELI_OPS_DSW_CLOSE"]
        );
        assert_eq!(out[0].device_phase, "B");
        assert_eq!(out[1].device_phase, "C");
        assert_eq!(out[2].device_phase, "-");
    }

    #[test]
    fn test_missing_columns() {
        let t = EventTable {
            columns: vec!["feeder".into(), "time".into()],
            records: vec![],
        };
        let err = ScadaClassifier
            .extract(&t, FEEDER, &Selection::Default)
            .unwrap_err();
        assert!(err.to_string().contains("text"));
    }
}
