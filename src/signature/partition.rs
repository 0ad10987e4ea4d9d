//! Feeder partitioning for the parallel build and labelling passes.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{PamError, Result};

/// Resolve a configured job count. Negative values count back from the
/// number of available cores (`-1` means all of them).
pub fn resolve_jobs(n_jobs: i64) -> Result<usize> {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as i64;
    resolve_jobs_with(n_jobs, cpus)
}

fn resolve_jobs_with(n_jobs: i64, cpus: i64) -> Result<usize> {
    match n_jobs {
        0 => Err(PamError::ZeroParallelism),
        n if n < 0 => Ok((cpus + 1 + n).max(1) as usize),
        n => Ok(n as usize),
    }
}

/// Deal `feeders` (heaviest first) into `n` groups back and forth:
/// n-1, .., 1, 0, 0, 1, .., n-1, n-1, ...
pub fn serpentine<T: Clone>(feeders: &[T], n: usize) -> Vec<Vec<T>> {
    let n = n.max(1);
    let mut groups = vec![Vec::new(); n];
    for (i, f) in feeders.iter().enumerate() {
        let offset = (i % (2 * n)) as i64 - n as i64;
        let group = if offset < 0 {
            (offset.unsigned_abs() - 1) as usize
        } else {
            offset as usize
        };
        groups[group].push(f.clone());
    }
    groups
}

/// Feeders ordered by descending workload, ties broken by id.
pub fn by_workload(counts: &BTreeMap<String, usize>) -> Vec<String> {
    let mut feeders: Vec<(&String, &usize)> = counts.iter().collect();
    feeders.sort_by(|(fa, ca), (fb, cb)| cb.cmp(ca).then(fa.cmp(fb)));
    feeders.into_iter().map(|(f, _)| f.clone()).collect()
}

/// Split feeders into `n` shuffled groups of roughly equal workload.
pub fn partition(counts: &BTreeMap<String, usize>, n: usize, seed: Option<u64>) -> Vec<Vec<String>> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut groups = serpentine(&by_workload(counts), n);
    for group in &mut groups {
        group.shuffle(&mut rng);
    }
    groups
}
