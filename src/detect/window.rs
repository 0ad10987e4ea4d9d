//! Window sizing and trailing-window statistics.

use chrono::Duration;

use super::Sample;

/// Series with fewer rows than this are never evaluated.
pub const MIN_ROWS: usize = 24;

/// A flagged sample needs more than this many samples in the 24 hours up to
/// and including itself.
pub const SUPPORT_SAMPLES: usize = 24;

/// Number of samples that approximates a trailing window of `hours`, or
/// `None` when the series is too sparse to size a window at all.
pub fn window_size(samples: &[Sample], hours: f64) -> Option<usize> {
    let (first, last) = match (samples.first(), samples.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => return None,
    };
    let span_hours = (last.time - first.time).num_milliseconds() as f64 / 3_600_000.0;
    if span_hours < 1.0 || samples.len() < MIN_ROWS {
        return None;
    }
    let per_hour = samples.len() as f64 / span_hours;
    Some((per_hour * hours).ceil() as usize)
}

/// Trailing quantile over `window` samples including the current one, with
/// linear interpolation between order statistics. Undefined (`None`) until
/// `window` samples are available.
pub fn rolling_quantile(values: &[f64], window: usize, q: f64) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window == 0 {
        return out;
    }
    let mut sorted: Vec<f64> = Vec::with_capacity(window + 1);
    for (i, &v) in values.iter().enumerate() {
        let pos = sorted.partition_point(|x| x.total_cmp(&v).is_lt());
        sorted.insert(pos, v);
        if i >= window {
            let old = values[i - window];
            let pos = sorted.partition_point(|x| x.total_cmp(&old).is_lt());
            sorted.remove(pos);
        }
        if i + 1 >= window {
            out[i] = Some(interpolate(&sorted, q));
        }
    }
    out
}

fn interpolate(sorted: &[f64], q: f64) -> f64 {
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Trailing mean and sample standard deviation over `window` samples
/// including the current one.
pub fn rolling_mean_std(values: &[f64], window: usize) -> Vec<Option<(f64, f64)>> {
    let mut out = vec![None; values.len()];
    if window < 2 {
        return out;
    }
    for i in (window - 1)..values.len() {
        let slice = &values[i + 1 - window..=i];
        let n = slice.len() as f64;
        let mean = slice.iter().sum::<f64>() / n;
        let var = slice.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        out[i] = Some((mean, var.sqrt()));
    }
    out
}

/// Count the samples in `(t - 24h, t]` for the sample at `idx`, considering
/// only those where `eligible` is true.
pub fn support_count(samples: &[Sample], eligible: &[bool], idx: usize) -> usize {
    let t = samples[idx].time;
    let start = t - Duration::hours(24);
    let lo = samples.partition_point(|s| s.time <= start);
    let hi = samples.partition_point(|s| s.time <= t);
    (lo..hi).filter(|&j| eligible[j]).count()
}

/// True when the sample at `idx` has enough supporting density.
pub fn is_supported(samples: &[Sample], eligible: &[bool], idx: usize) -> bool {
    support_count(samples, eligible, idx) > SUPPORT_SAMPLES
}
