use std::collections::BTreeMap;

use tracing::debug;

use super::window::{is_supported, rolling_mean_std, rolling_quantile, window_size};
use super::{Detection, Sample, SignalKind};

/// Standard deviations above the trailing mean that count as a spike.
const SPIKE_SIGMA: f64 = 7.0;

/// Quantile used by the V3 detectors.
const LOW_QUANTILE: f64 = 0.01;

/// Detection method applied to one point's series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Near-zero sample while the trailing 1st percentile is well above zero.
    QuantileV3(SignalKind),
    /// Near-zero sample immediately after a healthy one.
    HysteresisV4(SignalKind),
    /// Sample above the previous trailing mean + 7 sigma.
    Spike,
}

pub struct RollingWindowDetector {
    window_hours: f64,
}

impl Default for RollingWindowDetector {
    fn default() -> Self {
        Self { window_hours: 24.0 }
    }
}

impl RollingWindowDetector {
    pub fn new(window_hours: f64) -> Self {
        Self { window_hours }
    }

    pub fn run(&self, method: Method, samples: &[Sample]) -> Detection {
        match method {
            Method::QuantileV3(kind) => self.quantile_v3(samples, kind),
            Method::HysteresisV4(kind) => self.hysteresis_v4(samples, kind),
            Method::Spike => self.spikes(samples),
        }
    }

    /// Run `method` over every point independently. Points too sparse to
    /// evaluate are skipped.
    pub fn run_points<'a>(
        &self,
        method: Method,
        points: &'a BTreeMap<String, Vec<Sample>>,
    ) -> Vec<(&'a str, Vec<usize>)> {
        let mut out = Vec::new();
        for (point, samples) in points {
            match self.run(method, samples) {
                Detection::TooSparse => {
                    debug!(%point, rows = samples.len(), "series too sparse, skipped");
                }
                Detection::Flagged(idx) if idx.is_empty() => {}
                Detection::Flagged(idx) => out.push((point.as_str(), idx)),
            }
        }
        out
    }

    /// V3: value in the near-zero band while the trailing 1st percentile over
    /// the sized window exceeds the signal's threshold.
    pub fn quantile_v3(&self, samples: &[Sample], kind: SignalKind) -> Detection {
        let window = match window_size(samples, self.window_hours) {
            Some(w) => w,
            None => return Detection::TooSparse,
        };
        let values: Vec<f64> = samples
            .iter()
            .map(|s| if kind.uses_magnitude() { s.value.abs() } else { s.value })
            .collect();
        let quantiles = rolling_quantile(&values, window, LOW_QUANTILE);
        let all = vec![true; samples.len()];
        let threshold = kind.quantile_threshold();

        let flagged = (0..samples.len())
            .filter(|&i| kind.in_band(values[i]))
            .filter(|&i| quantiles[i].map_or(false, |q| q > threshold))
            .filter(|&i| is_supported(samples, &all, i))
            .collect();
        Detection::Flagged(flagged)
    }

    /// V4: a low sample immediately preceded by an okay sample. Support is
    /// counted over samples whose predecessor was okay.
    pub fn hysteresis_v4(&self, samples: &[Sample], kind: SignalKind) -> Detection {
        if window_size(samples, self.window_hours).is_none() {
            return Detection::TooSparse;
        }
        let value = |i: usize| {
            let v = samples[i].value;
            if kind.uses_magnitude() {
                v.abs()
            } else {
                v
            }
        };
        let prev_okay: Vec<bool> = (0..samples.len())
            .map(|i| i > 0 && kind.is_okay(value(i - 1)))
            .collect();

        let flagged = (0..samples.len())
            .filter(|&i| kind.in_band(value(i)) && prev_okay[i])
            .filter(|&i| is_supported(samples, &prev_okay, i))
            .collect();
        Detection::Flagged(flagged)
    }

    /// Spike: value above the previous sample's rolling mean + 7 sigma.
    pub fn spikes(&self, samples: &[Sample]) -> Detection {
        let window = match window_size(samples, self.window_hours) {
            Some(w) => w,
            None => return Detection::TooSparse,
        };
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        let stats = rolling_mean_std(&values, window);
        let all = vec![true; samples.len()];

        let flagged = (1..samples.len())
            .filter(|&i| {
                stats[i - 1].map_or(false, |(mean, std)| values[i] > mean + SPIKE_SIGMA * std)
            })
            .filter(|&i| is_supported(samples, &all, i))
            .collect();
        Detection::Flagged(flagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 6, 1, 0, 0, 0).unwrap()
    }

    /// Samples every 30 minutes.
    fn series(values: &[f64]) -> Vec<Sample> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Sample::new(t0() + Duration::minutes(30 * i as i64), v))
            .collect()
    }

    #[test]
    fn test_short_series_is_sparse_for_every_method() {
        let samples = series(&[0.0; 23]);
        let detector = RollingWindowDetector::default();
        for method in [
            Method::QuantileV3(SignalKind::Current),
            Method::HysteresisV4(SignalKind::Current),
            Method::QuantileV3(SignalKind::Voltage),
            Method::HysteresisV4(SignalKind::Power),
            Method::Spike,
        ] {
            assert_eq!(detector.run(method, &samples), Detection::TooSparse);
        }
    }

    #[test]
    fn test_v4_flags_drop_after_healthy_run() {
        // 60 healthy samples (30h) then a drop to zero
        let mut values = vec![50.0; 60];
        values.push(0.0);
        values.push(0.0);
        let samples = series(&values);
        let detection =
            RollingWindowDetector::default().hysteresis_v4(&samples, SignalKind::Current);
        assert_eq!(detection, Detection::Flagged(vec![60]));
    }

    #[test]
    fn test_v3_flags_only_with_high_trailing_quantile() {
        let mut values = vec![50.0; 100];
        values.push(0.2);
        let samples = series(&values);
        let detector = RollingWindowDetector::default();
        let detection = detector.quantile_v3(&samples, SignalKind::Current);
        assert_eq!(detection.indices(), &[100]);

        // A series that idles near zero never has a high 1st percentile.
        let idle = series(&[0.2; 101]);
        assert!(detector.quantile_v3(&idle, SignalKind::Current).indices().is_empty());
    }

    #[test]
    fn test_v3_and_v4_disagree_on_repeated_drops() {
        // A second drop inside the same window pulls the trailing percentile
        // down, so only V4 reports it.
        let mut values = vec![50.0; 100];
        values.extend([0.2, 50.0, 0.2]);
        let samples = series(&values);
        let detector = RollingWindowDetector::default();
        let v3 = detector.quantile_v3(&samples, SignalKind::Current);
        let v4 = detector.hysteresis_v4(&samples, SignalKind::Current);
        assert_eq!(v3.indices(), &[100]);
        assert_eq!(v4.indices(), &[100, 102]);
    }

    #[test]
    fn test_spike_above_seven_sigma() {
        let mut values: Vec<f64> = (0..100).map(|i| 2.0 + (i % 2) as f64 * 0.1).collect();
        values.push(40.0);
        let samples = series(&values);
        let detection = RollingWindowDetector::default().spikes(&samples);
        assert_eq!(detection.indices(), &[100]);
    }

    #[test]
    fn test_power_factor_uses_magnitude() {
        let mut values = vec![-0.99; 100];
        values.push(-0.7);
        let samples = series(&values);
        let detection =
            RollingWindowDetector::default().quantile_v3(&samples, SignalKind::PowerFactor);
        assert_eq!(detection.indices(), &[100]);
    }
}
