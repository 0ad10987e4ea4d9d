//! Drives cleaning, the partitioned build, and labelling over a whole
//! anomaly set. Partitions run on tokio's blocking pool.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use futures::future::try_join_all;
use tracing::{debug, info};

use super::clean::clean;
use super::partition::{by_workload, partition, resolve_jobs, serpentine};
use super::{
    ColumnSpec, FeederTable, SignatureBuilder, SignatureTable, TargetAssigner, TargetColumns,
};
use crate::anomaly::{AnomalyRecord, AnomalyStore};
use crate::classify::Ticket;
use crate::error::{PamError, Result};

pub struct SignatureTransformer {
    specs: Arc<Vec<ColumnSpec>>,
    anomaly_map: BTreeMap<String, String>,
    feeders: Arc<FeederTable>,
    target: TargetColumns,
    n_jobs: usize,
    seed: Option<u64>,
    table: Option<SignatureTable>,
}

impl SignatureTransformer {
    pub fn new(
        specs: Vec<ColumnSpec>,
        anomaly_map: BTreeMap<String, String>,
        feeders: FeederTable,
        n_jobs: i64,
    ) -> Result<Self> {
        Ok(Self {
            specs: Arc::new(specs),
            anomaly_map,
            feeders: Arc::new(feeders),
            target: TargetColumns::default(),
            n_jobs: resolve_jobs(n_jobs)?,
            seed: None,
            table: None,
        })
    }

    /// Fix the shuffle seed so partition contents are reproducible.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_target(mut self, target: TargetColumns) -> Self {
        self.target = target;
        self
    }

    pub fn n_jobs(&self) -> usize {
        self.n_jobs
    }

    pub fn specs(&self) -> &[ColumnSpec] {
        &self.specs
    }

    pub fn clean(&self, records: &[AnomalyRecord]) -> AnomalyStore {
        clean(records, &self.specs, &self.anomaly_map, &self.feeders)
    }

    /// Clean `records` and build every partition on the calling thread.
    pub fn transform_sync(
        &mut self,
        records: &[AnomalyRecord],
        tickets: Option<&[Ticket]>,
    ) -> &SignatureTable {
        let cleaned = self.clean(records);
        let by_feeder = cleaned.by_feeder();
        let tickets = tickets.map(group_tickets);
        let builder = SignatureBuilder::new(&self.specs, &self.feeders)
            .with_target(self.target.clone());

        let mut table = builder.empty_table();
        for group in partition(&cleaned.feeder_counts(), self.n_jobs, self.seed) {
            table.extend(builder.build(&by_feeder, tickets.as_ref(), &group));
        }
        info!(rows = table.len(), feeders = by_feeder.len(), "signatures built");
        self.table.insert(table)
    }

    /// Clean `records` and build each partition on a blocking worker.
    pub async fn transform(
        &mut self,
        records: &[AnomalyRecord],
        tickets: Option<&[Ticket]>,
    ) -> anyhow::Result<&SignatureTable> {
        let cleaned = self.clean(records);
        let groups = partition(&cleaned.feeder_counts(), self.n_jobs, self.seed);
        let by_feeder = Arc::new(cleaned.by_feeder());
        let tickets = Arc::new(tickets.map(group_tickets));

        let tasks = groups.into_iter().map(|group| {
            let specs = Arc::clone(&self.specs);
            let feeders = Arc::clone(&self.feeders);
            let by_feeder = Arc::clone(&by_feeder);
            let tickets = Arc::clone(&tickets);
            let target = self.target.clone();
            tokio::task::spawn_blocking(move || {
                debug!(feeders = group.len(), "building partition");
                SignatureBuilder::new(&specs, &feeders)
                    .with_target(target)
                    .build(&by_feeder, (*tickets).as_ref(), &group)
            })
        });
        let parts = try_join_all(tasks)
            .await
            .context("signature build worker failed")?;

        let mut table = SignatureBuilder::new(&self.specs, &self.feeders)
            .with_target(self.target.clone())
            .empty_table();
        for part in parts {
            table.extend(part);
        }
        info!(rows = table.len(), feeders = by_feeder.len(), "signatures built");
        Ok(&*self.table.insert(table))
    }

    /// Label the built table on the calling thread.
    pub fn add_target_sync(
        &mut self,
        tickets: &[Ticket],
        assigner: &TargetAssigner,
    ) -> Result<&SignatureTable> {
        let table = self.table.as_ref().ok_or(PamError::NotBuilt)?;
        let (mut out, jobs) = self.label_jobs(table, tickets);
        assigner.reset(&mut out);
        for (mut part, part_tickets) in jobs {
            assigner.assign(&mut part, &part_tickets);
            out.extend(part);
        }
        info!(rows = out.len(), outage = %assigner.columns.outage, "targets assigned");
        Ok(&*self.table.insert(out))
    }

    /// Label the built table, one blocking worker per ticket partition.
    pub async fn add_target(
        &mut self,
        tickets: &[Ticket],
        assigner: &TargetAssigner,
    ) -> anyhow::Result<&SignatureTable> {
        let table = self.table.as_ref().ok_or(PamError::NotBuilt)?;
        let (mut out, jobs) = self.label_jobs(table, tickets);
        assigner.reset(&mut out);

        let tasks = jobs.into_iter().map(|(mut part, part_tickets)| {
            let assigner = assigner.clone();
            tokio::task::spawn_blocking(move || {
                assigner.assign(&mut part, &part_tickets);
                part
            })
        });
        // the built table stays in place until every worker has succeeded
        let parts = try_join_all(tasks)
            .await
            .context("target assignment worker failed")?;
        for part in parts {
            out.extend(part);
        }
        info!(rows = out.len(), outage = %assigner.columns.outage, "targets assigned");
        Ok(&*self.table.insert(out))
    }

    /// Split `table` into rows with no tickets, which pass through, and
    /// per-partition rows paired with their tickets.
    fn label_jobs(
        &self,
        table: &SignatureTable,
        tickets: &[Ticket],
    ) -> (SignatureTable, Vec<(SignatureTable, Vec<Ticket>)>) {
        let grouped = group_tickets(&first_occurrences(tickets));
        let passthrough = table.select(|f| !grouped.contains_key(f));

        let counts: BTreeMap<String, usize> =
            grouped.iter().map(|(f, t)| (f.clone(), t.len())).collect();
        let jobs = serpentine(&by_workload(&counts), self.n_jobs)
            .into_iter()
            .filter(|part| !part.is_empty())
            .map(|part| {
                let members: HashSet<&str> = part.iter().map(String::as_str).collect();
                let rows = table.select(|f| members.contains(f));
                let part_tickets = part
                    .iter()
                    .filter_map(|f| grouped.get(f))
                    .flatten()
                    .cloned()
                    .collect();
                (rows, part_tickets)
            })
            .collect();
        (passthrough, jobs)
    }

    pub fn table(&self) -> Option<&SignatureTable> {
        self.table.as_ref()
    }

    pub fn into_table(self) -> Option<SignatureTable> {
        self.table
    }
}

/// Tickets keyed by feeder, input order kept within a feeder.
pub fn group_tickets(tickets: &[Ticket]) -> BTreeMap<String, Vec<Ticket>> {
    let mut grouped: BTreeMap<String, Vec<Ticket>> = BTreeMap::new();
    for t in tickets {
        grouped.entry(t.feeder_id.clone()).or_default().push(t.clone());
    }
    grouped
}

fn first_occurrences(tickets: &[Ticket]) -> Vec<Ticket> {
    let mut seen = HashSet::new();
    tickets
        .iter()
        .filter(|t| seen.insert(t.ticket_id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{AnomalyBuilder, Device};
    use crate::signature::{parse_columns, ColumnSpecConfig, FeatureValue, FeederMeta};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    const FEEDERS: &[&str] = &["410001", "410002", "410003", "410004"];

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 7, 1, 0, 0, 0).unwrap()
    }

    fn specs() -> Vec<ColumnSpec> {
        let col = |name: &str, lookup: &str, kind: &str| ColumnSpecConfig {
            name: name.into(),
            lookup: lookup.into(),
            kind: kind.into(),
            min_lag_hours: 0.0,
            max_lag_hours: 24.0,
            keep_all: Some(true),
        };
        parse_columns(&[
            col("FC", "FAULT_CURRENT", "trigger"),
            col("RT", "RELAY_TRIP", "background"),
        ])
        .unwrap()
    }

    fn records() -> Vec<AnomalyRecord> {
        let mut all = AnomalyBuilder::default();
        for (i, feeder) in FEEDERS.iter().enumerate() {
            let mut b = AnomalyBuilder::new(feeder);
            for k in 0..=i {
                let t = t0() + Duration::hours(6 * k as i64);
                b.push("RELAY_TRIP", t - Duration::minutes(10), "trip", Device::none());
                b.push("FAULT_CURRENT", t, "fault", Device::none());
            }
            all.merge(b);
        }
        all.finish()
    }

    fn transformer(n_jobs: i64) -> SignatureTransformer {
        let map = ["FAULT_CURRENT", "RELAY_TRIP"]
            .iter()
            .map(|n| (n.to_string(), n.to_string()))
            .collect();
        let feeders = FeederTable::new(
            FEEDERS
                .iter()
                .map(|f| FeederMeta::new(f, 500.0, 1.0, 0.0))
                .collect(),
        );
        SignatureTransformer::new(specs(), map, feeders, n_jobs)
            .unwrap()
            .with_seed(Some(11))
    }

    fn ticket(id: &str, feeder: &str, off: DateTime<Utc>) -> Ticket {
        Ticket {
            ticket_id: id.into(),
            feeder_id: feeder.into(),
            power_off: off,
            power_restore: off + Duration::hours(1),
            interruption_type: "FDR".into(),
            repair_action: String::new(),
        }
    }

    #[test]
    fn test_partition_count_does_not_change_rows() {
        let mut single = transformer(1);
        let mut a = single.transform_sync(&records(), None).clone();
        let mut multi = transformer(3);
        let mut b = multi.transform_sync(&records(), None).clone();
        a.sort_canonical();
        b.sort_canonical();
        assert_eq!(a, b);
        // 1 + 2 + 3 + 4 fault instants
        assert_eq!(a.len(), 10);
        // last 410004 row sees all four faults and trips within a day
        assert_eq!(a.x[9], vec![FeatureValue::Count(4), FeatureValue::Count(4)]);
    }

    #[test]
    fn test_zero_jobs_rejected() {
        let result = SignatureTransformer::new(specs(), BTreeMap::new(), FeederTable::default(), 0);
        assert!(matches!(result, Err(PamError::ZeroParallelism)));
    }

    #[test]
    fn test_add_target_requires_build() {
        let mut t = transformer(2);
        let assigner = TargetAssigner::new(24.0, 0.0, TargetColumns::default());
        assert!(matches!(
            t.add_target_sync(&[], &assigner),
            Err(PamError::NotBuilt)
        ));
    }

    #[test]
    fn test_add_target_resets_feeders_without_tickets() {
        let mut t = transformer(2);
        let tickets = vec![
            ticket("A", "410001", t0() + Duration::hours(5)),
            ticket("B", "410001", t0() + Duration::hours(2)),
            ticket("C", "410004", t0() + Duration::hours(1)),
        ];
        t.transform_sync(&records(), Some(&tickets));
        let assigner = TargetAssigner::new(24.0, 0.0, TargetColumns::default());
        let mut table = t.add_target_sync(&tickets[..2], &assigner).unwrap().clone();
        table.sort_canonical();

        assert_eq!(table.y[0].feeder_id, "410001");
        assert_eq!(table.y[0].labels[0].outage_hours, Some(2.0));
        assert_eq!(table.y[0].labels[0].ticket_id.as_deref(), Some("B"));
        assert!(table
            .y
            .iter()
            .filter(|k| k.feeder_id == "410004")
            .all(|k| !k.labels[0].is_set()));
    }

    #[tokio::test]
    async fn test_failed_labelling_keeps_built_table() {
        let tickets = vec![ticket("A", "410002", t0() + Duration::hours(7))];
        let mut t = transformer(2);
        t.transform(&records(), Some(&tickets)).await.unwrap();
        let built = t.table().cloned().unwrap();
        assert!(built.y.iter().any(|k| k.labels[0].is_set()));

        // a lookahead this long overflows the calendar inside the worker
        let assigner = TargetAssigner {
            lookahead: Duration::days(365 * 280_000),
            lookback: Duration::zero(),
            columns: TargetColumns::default(),
        };
        assert!(t.add_target(&tickets, &assigner).await.is_err());
        assert_eq!(t.table(), Some(&built));
    }

    #[tokio::test]
    async fn test_async_matches_sync() {
        let tickets = vec![ticket("A", "410003", t0() + Duration::hours(7))];

        let mut sync = transformer(3);
        sync.transform_sync(&records(), None);
        let assigner = TargetAssigner::new(12.0, 1.0, TargetColumns::default());
        let mut expected = sync.add_target_sync(&tickets, &assigner).unwrap().clone();

        let mut parallel = transformer(3);
        parallel.transform(&records(), None).await.unwrap();
        let mut actual = parallel.add_target(&tickets, &assigner).await.unwrap().clone();

        expected.sort_canonical();
        actual.sort_canonical();
        assert_eq!(expected, actual);
        let labelled = actual.y.iter().filter(|k| k.labels[0].is_set()).count();
        // 410003 faults at 0h and 6h fall inside (7h - 12h, 8h)
        assert_eq!(labelled, 2);
    }
}
