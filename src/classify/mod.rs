//! Rule-based anomaly extraction, one classifier per source.
//!
//! Every classifier is a pure function over a canonical [`EventTable`] for a
//! single feeder. Rows belonging to other feeders are ignored and malformed
//! payload fields degrade to sentinels instead of failing the pass.

pub mod ami;
pub mod edna;
pub mod scada;
pub mod tickets;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::anomaly::{AnomalyRecord, AnomalyStore, NOT_APPLICABLE};
use crate::error::{PamError, Result};
use crate::table::EventTable;

pub use ami::AmiClassifier;
pub use edna::EdnaClassifier;
pub use scada::ScadaClassifier;
pub use tickets::{Ticket, TicketClassifier};

/// Which anomaly names a pass should produce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    #[default]
    Default,
    All,
    Named(Vec<String>),
}

impl Selection {
    /// Parse `default`, `all`, or a comma separated list of names.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "default" => Selection::Default,
            "all" => Selection::All,
            names => Selection::Named(
                names
                    .split(',')
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect(),
            ),
        }
    }

    /// Resolve against a source vocabulary. Names outside `all` are a
    /// configuration error that lists every offender.
    pub fn resolve(
        &self,
        source: &'static str,
        all: &[&'static str],
        default: &[&'static str],
    ) -> Result<Selected> {
        let names = match self {
            Selection::Default => default.iter().copied().collect(),
            Selection::All => all.iter().copied().collect(),
            Selection::Named(requested) => {
                let unknown: Vec<String> = requested
                    .iter()
                    .filter(|n| !all.contains(&n.as_str()))
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    return Err(PamError::UnknownAnomaly {
                        source_name: source,
                        names: unknown,
                    });
                }
                all.iter()
                    .copied()
                    .filter(|a| requested.iter().any(|n| n == a))
                    .collect()
            }
        };
        Ok(Selected { names })
    }
}

/// A resolved selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected {
    names: BTreeSet<&'static str>,
}

impl Selected {
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn any(&self, names: &[&str]) -> bool {
        names.iter().any(|n| self.contains(n))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.names.iter().copied()
    }
}

/// Optional extraction window. `start` is always inclusive; whether `end`
/// is depends on the source (see [`Classifier::end_inclusive`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBounds {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeBounds {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, t: DateTime<Utc>, end_inclusive: bool) -> bool {
        let after_start = self.start.map_or(true, |s| t >= s);
        let before_end = match self.end {
            Some(e) if end_inclusive => t <= e,
            Some(e) => t < e,
            None => true,
        };
        after_start && before_end
    }

    /// Drop rows whose `column` instant falls outside the bounds. Rows where
    /// the column is absent or unparseable are kept for decode to report.
    pub fn filter_rows(&self, table: &EventTable, column: &str, end_inclusive: bool) -> EventTable {
        let records = table
            .records
            .iter()
            .filter(|record| {
                match record
                    .get(column)
                    .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
                {
                    Some(t) => self.contains(t, end_inclusive),
                    None => true,
                }
            })
            .cloned()
            .collect();
        EventTable {
            columns: table.columns.clone(),
            records,
        }
    }
}

/// A per-source rule classifier.
pub trait Classifier: Send + Sync {
    /// Short source name used in errors and logs.
    fn source(&self) -> &'static str;

    fn all_anomalies(&self) -> &'static [&'static str];

    fn default_anomalies(&self) -> &'static [&'static str];

    fn required_columns(&self) -> &'static [&'static str];

    /// Column whose instant bounds rows before classification. Sources
    /// without one are bounded on the emitted anomaly times only.
    fn row_time_column(&self) -> Option<&'static str> {
        None
    }

    /// Whether the upper time bound admits an instant equal to it.
    fn end_inclusive(&self) -> bool {
        true
    }

    /// Feeders that have at least one row in `table`.
    fn feeders(&self, table: &EventTable) -> Result<BTreeSet<String>>;

    /// Extract the selected anomalies for one feeder.
    fn extract(
        &self,
        table: &EventTable,
        feeder_id: &str,
        selection: &Selection,
    ) -> Result<Vec<AnomalyRecord>>;
}

/// Run `classifier` over every feeder in `feeders` and collect the output.
/// The store counts as extracted even when `feeders` is empty.
pub fn extract_feeders(
    classifier: &dyn Classifier,
    table: &EventTable,
    feeders: &BTreeSet<String>,
    selection: &Selection,
    bounds: &TimeBounds,
) -> Result<AnomalyStore> {
    let end_inclusive = classifier.end_inclusive();
    let bounded;
    let table = match classifier.row_time_column() {
        Some(column) if !bounds.is_unbounded() => {
            bounded = bounds.filter_rows(table, column, end_inclusive);
            debug!(
                source = classifier.source(),
                kept = bounded.len(),
                dropped = table.len() - bounded.len(),
                "rows bounded"
            );
            &bounded
        }
        _ => table,
    };

    let mut store = AnomalyStore::from_records(Vec::new());
    for feeder in feeders {
        let mut records = classifier.extract(table, feeder, selection)?;
        records.retain(|r| bounds.contains(r.timestamp, end_inclusive));
        debug!(source = classifier.source(), %feeder, anomalies = records.len(), "feeder extracted");
        store.append(records);
    }
    info!(
        source = classifier.source(),
        feeders = feeders.len(),
        anomalies = store.len(),
        "extraction complete"
    );
    Ok(store)
}

/// The `i`th space-delimited token of an alarm string, or `"-"`.
pub(crate) fn token(text: &str, i: usize) -> &str {
    text.split(' ').nth(i).unwrap_or(NOT_APPLICABLE)
}

/// The `i`th character of `s` as a string, or `"-"` when out of range.
pub(crate) fn char_at(s: &str, i: usize) -> String {
    s.chars()
        .nth(i)
        .map(String::from)
        .unwrap_or_else(|| NOT_APPLICABLE.to_string())
}

pub(crate) fn contains_all(text: &str, needles: &[&str]) -> bool {
    needles.iter().all(|n| text.contains(n))
}

pub(crate) fn contains_none(text: &str, needles: &[&str]) -> bool {
    !needles.iter().any(|n| text.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[&str] = &["A", "B", "C"];
    const DEFAULT: &[&str] = &["A"];

    #[test]
    fn test_selection_parse() {
        assert_eq!(Selection::parse("default"), Selection::Default);
        assert_eq!(Selection::parse("all"), Selection::All);
        assert_eq!(
            Selection::parse("A, C"),
            Selection::Named(vec!["A".into(), "C".into()])
        );
    }

    #[test]
    fn test_resolve_rejects_unknown_names() {
        let sel = Selection::Named(vec!["A".into(), "X".into(), "Y".into()]);
        match sel.resolve("scada", ALL, DEFAULT) {
            Err(PamError::UnknownAnomaly { source_name, names }) => {
                assert_eq!(source_name, "scada");
                assert_eq!(names, vec!["X".to_string(), "Y".to_string()]);
            }
            other => panic!("expected UnknownAnomaly, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_default_and_all() {
        let d = Selection::Default.resolve("s", ALL, DEFAULT).unwrap();
        assert!(d.contains("A") && !d.contains("B"));
        let a = Selection::All.resolve("s", ALL, DEFAULT).unwrap();
        assert_eq!(a.names().count(), 3);
        assert!(a.any(&["Z", "C"]));
    }

    fn at(h: u32) -> DateTime<Utc> {
        use chrono::TimeZone;
        Utc.with_ymd_and_hms(2015, 7, 14, h, 0, 0).unwrap()
    }

    fn scada_rows(rows: &[(&str, DateTime<Utc>)]) -> EventTable {
        let rows: Vec<scada::ScadaEvent> = rows
            .iter()
            .map(|(text, time)| scada::ScadaEvent {
                feeder: "505963".into(),
                text: text.to_string(),
                time: *time,
            })
            .collect();
        EventTable::from_rows(scada::COLUMNS, &rows)
    }

    #[test]
    fn test_empty_feeder_set_still_exports() {
        let table = scada_rows(&[]);
        let store = extract_feeders(
            &ScadaClassifier,
            &table,
            &BTreeSet::new(),
            &Selection::Default,
            &TimeBounds::default(),
        )
        .unwrap();
        assert!(store.is_empty());
        assert!(store.to_columns().unwrap().is_empty());
    }

    #[test]
    fn test_bounds_edges() {
        let b = TimeBounds::new(Some(at(1)), Some(at(3)));
        assert!(!b.contains(at(0), true));
        assert!(b.contains(at(1), true));
        assert!(b.contains(at(3), true));
        assert!(!b.contains(at(3), false));
        assert!(b.contains(at(2), false));
        assert!(TimeBounds::default().contains(at(0), false));
    }

    #[test]
    fn test_bounded_extraction_keeps_inclusive_edges() {
        let alarm = "X FDRHD 1234 IA LIM-HIGH 950";
        let table = scada_rows(&[(alarm, at(0)), (alarm, at(1)), (alarm, at(2)), (alarm, at(3))]);
        let feeders = ScadaClassifier.feeders(&table).unwrap();
        let store = extract_feeders(
            &ScadaClassifier,
            &table,
            &feeders,
            &Selection::Named(vec!["FAULT_CURRENT".into()]),
            &TimeBounds::new(Some(at(1)), Some(at(2))),
        )
        .unwrap();
        let times: Vec<_> = store.records().iter().map(|r| r.timestamp).collect();
        assert_eq!(times, vec![at(1), at(2)]);
    }

    #[test]
    fn test_bounds_keep_unparseable_rows() {
        let mut table = scada_rows(&[("A", at(0)), ("B", at(5))]);
        table.records[1].insert("time".into(), serde_json::Value::from("garbage"));
        let kept = TimeBounds::new(Some(at(1)), None).filter_rows(&table, "time", true);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.records[0]["text"], "B");
    }

    #[test]
    fn test_token_fallbacks() {
        let text = "X FDRHD 1234 IA";
        assert_eq!(token(text, 1), "FDRHD");
        assert_eq!(token(text, 5), "-");
        assert_eq!(char_at("IA", 1), "A");
        assert_eq!(char_at("-", 1), "-");
    }
}
