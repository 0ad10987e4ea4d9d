//! Outage ticket rules.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Classifier, Selection};
use crate::anomaly::{AnomalyBuilder, AnomalyRecord, Device, NOT_APPLICABLE};
use crate::error::Result;
use crate::table::{lenient_string, EventTable};

const SOURCE: &str = "tickets";

pub const COLUMNS: &[&str] = &[
    "ticket_id",
    "feeder_id",
    "power_off",
    "power_restore",
    "interruption_type",
    "repair_action",
];

pub const ANOMALIES: &[&str] = &["RE_FUSE_ONLY", "LATERAL_OUTAGES"];

/// Interruption types that describe a feeder-level event.
const INTERRUPTIONS: &[&str] = &["OCR", "LAT", "FDR"];
const LATERALS: &[&str] = &["OCR", "LAT"];

/// One outage ticket row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(deserialize_with = "lenient_string")]
    pub ticket_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub feeder_id: String,
    pub power_off: DateTime<Utc>,
    pub power_restore: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub interruption_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub repair_action: String,
}

impl Ticket {
    pub fn load_all(table: &EventTable) -> Result<Vec<Ticket>> {
        table.decode(SOURCE, COLUMNS)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TicketClassifier;

impl Classifier for TicketClassifier {
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

    fn feeders(&self, table: &EventTable) -> Result<BTreeSet<String>> {
        Ok(Ticket::load_all(table)?
            .into_iter()
            .map(|t| t.feeder_id)
            .collect())
    }

    fn extract(
        &self,
        table: &EventTable,
        feeder_id: &str,
        selection: &Selection,
    ) -> Result<Vec<AnomalyRecord>> {
        let selected = selection.resolve(SOURCE, ANOMALIES, ANOMALIES)?;
        let all = Ticket::load_all(table)?;
        let mut tickets: Vec<&Ticket> = all
            .iter()
            .filter(|t| t.feeder_id == feeder_id)
            .filter(|t| INTERRUPTIONS.contains(&t.interruption_type.as_str()))
            .collect();
        tickets.sort_by(|a, b| a.ticket_id.cmp(&b.ticket_id));

        let mut pass = AnomalyBuilder::new(feeder_id);
        let device = || Device::new("TICKETS", NOT_APPLICABLE, NOT_APPLICABLE);

        if selected.contains("RE_FUSE_ONLY") {
            let mut occurrences: HashMap<&str, usize> = HashMap::new();
            for t in &tickets {
                *occurrences.entry(t.ticket_id.as_str()).or_insert(0) += 1;
            }
            let mut step = AnomalyBuilder::new(feeder_id);
            for t in tickets
                .iter()
                .filter(|t| occurrences[t.ticket_id.as_str()] == 1)
                .filter(|t| t.repair_action.contains("Refuse"))
            {
                step.push("RE_FUSE_ONLY", t.power_restore, t.ticket_id.as_str(), device());
            }
            pass.merge(step);
        }

        if selected.contains("LATERAL_OUTAGES") {
            let mut seen = HashSet::new();
            let mut step = AnomalyBuilder::new(feeder_id);
            for t in tickets
                .iter()
                .filter(|t| LATERALS.contains(&t.interruption_type.as_str()))
                .filter(|t| seen.insert((t.ticket_id.as_str(), t.power_off)))
            {
                step.push("LATERAL_OUTAGES", t.power_off, t.ticket_id.as_str(), device());
            }
            pass.merge(step);
        }

        Ok(pass.finish())
    }
}
