//! Outage labels: for each signature row, the nearest ticketed outage on the
//! same feeder within a lookahead/lookback window.

use std::collections::HashSet;

use chrono::Duration;

use super::{hours, to_hours, SignatureTable, TargetColumns, TargetLabel};
use crate::classify::Ticket;

#[derive(Debug, Clone, PartialEq)]
pub struct TargetAssigner {
    pub lookahead: Duration,
    pub lookback: Duration,
    pub columns: TargetColumns,
}

impl TargetAssigner {
    pub fn new(lookahead_hours: f64, lookback_hours: f64, columns: TargetColumns) -> Self {
        Self {
            lookahead: hours(lookahead_hours),
            lookback: hours(lookback_hours),
            columns,
        }
    }

    /// Reset the target pair on every row of `table`.
    pub fn reset(&self, table: &mut SignatureTable) -> usize {
        let idx = table.ensure_target(&self.columns);
        for key in &mut table.y {
            key.labels[idx] = TargetLabel::default();
        }
        idx
    }

    /// Label `table` from `tickets`. Rows are matched on feeder; a ticket with
    /// power-off `t0` covers rows stamped in `(t0 - lookahead, t0 + lookback)`
    /// and the smallest `t0 - t` wins.
    pub fn assign(&self, table: &mut SignatureTable, tickets: &[Ticket]) {
        let idx = self.reset(table);
        let mut seen = HashSet::new();
        for ticket in tickets {
            if !seen.insert(ticket.ticket_id.as_str()) {
                continue;
            }
            let start = ticket.power_off - self.lookahead;
            let end = ticket.power_off + self.lookback;
            for key in table
                .y
                .iter_mut()
                .filter(|k| k.feeder_id == ticket.feeder_id)
                .filter(|k| k.timestamp > start && k.timestamp < end)
            {
                let delta = to_hours(ticket.power_off - key.timestamp);
                let label = &mut key.labels[idx];
                if label.outage_hours.map_or(true, |current| delta < current) {
                    label.outage_hours = Some(delta);
                    label.ticket_id = Some(ticket.ticket_id.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{FeatureValue, SignatureKey};
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 3, 5, 9, 0, 0).unwrap()
    }

    fn table(rows: &[(&str, DateTime<Utc>)]) -> SignatureTable {
        let mut table = SignatureTable::new(vec!["FC".into()], vec![TargetColumns::default()]);
        for (feeder, t) in rows {
            table.push(
                SignatureKey {
                    feeder_id: feeder.to_string(),
                    timestamp: *t,
                    labels: vec![TargetLabel {
                        outage_hours: Some(99.0),
                        ticket_id: Some("STALE".into()),
                    }],
                },
                vec![FeatureValue::Count(1)],
            );
        }
        table
    }

    fn ticket(id: &str, feeder: &str, off: DateTime<Utc>) -> Ticket {
        Ticket {
            ticket_id: id.into(),
            feeder_id: feeder.into(),
            power_off: off,
            power_restore: off + Duration::hours(2),
            interruption_type: "OCR".into(),
            repair_action: String::new(),
        }
    }

    #[test]
    fn test_smallest_delta_wins() {
        let mut t = table(&[("300300", t0())]);
        let assigner = TargetAssigner::new(24.0, 1.0, TargetColumns::default());
        assigner.assign(
            &mut t,
            &[
                ticket("T1", "300300", t0() + Duration::hours(5)),
                ticket("T2", "300300", t0() + Duration::hours(2)),
                ticket("T3", "300300", t0() + Duration::hours(7)),
            ],
        );
        assert_eq!(t.y[0].labels[0].outage_hours, Some(2.0));
        assert_eq!(t.y[0].labels[0].ticket_id.as_deref(), Some("T2"));
    }

    #[test]
    fn test_window_bounds_and_feeder_match() {
        let mut t = table(&[
            ("300300", t0()),
            ("300300", t0() - Duration::hours(24)),
            ("300301", t0()),
            ("300300", t0() + Duration::minutes(30)),
        ]);
        let assigner = TargetAssigner::new(24.0, 1.0, TargetColumns::default());
        assigner.assign(&mut t, &[ticket("T1", "300300", t0())]);

        let labels: Vec<Option<f64>> = t.y.iter().map(|k| k.labels[0].outage_hours).collect();
        // exactly lookahead before is excluded; other feeders are reset
        assert_eq!(labels, vec![Some(0.0), None, None, Some(-0.5)]);
        assert!(t.y[2].labels[0].ticket_id.is_none());
    }

    #[test]
    fn test_duplicate_ticket_ids_use_first_occurrence() {
        let mut t = table(&[("300300", t0())]);
        let assigner = TargetAssigner::new(24.0, 1.0, TargetColumns::default());
        assigner.assign(
            &mut t,
            &[
                ticket("T1", "300300", t0() + Duration::hours(6)),
                ticket("T1", "300300", t0() + Duration::hours(1)),
            ],
        );
        assert_eq!(t.y[0].labels[0].outage_hours, Some(6.0));
    }

    #[test]
    fn test_new_target_pair_is_registered() {
        let mut t = table(&[("300300", t0())]);
        let pair = TargetColumns {
            outage: "OUTAGE_48H".into(),
            ticket: "TICKET_48H".into(),
        };
        TargetAssigner::new(48.0, 0.0, pair.clone())
            .assign(&mut t, &[ticket("T9", "300300", t0() + Duration::hours(30))]);
        assert_eq!(t.targets.len(), 2);
        assert_eq!(t.y[0].labels[1].outage_hours, Some(30.0));
        assert_eq!(t.y[0].labels[0].outage_hours, Some(99.0));
    }
}
