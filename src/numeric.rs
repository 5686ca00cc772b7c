//! Quantiles, numeric summaries, and running variance.

use serde::Serialize;

use crate::dataset::Row;
use crate::value::parse_number;

/// Linear-interpolation quantile over an ascending-sorted slice.
/// Returns `None` on an empty slice.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let idx = (sorted.len() - 1) as f64 * q;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let w = idx - lo as f64;
    Some(sorted[lo] * (1.0 - w) + sorted[hi] * w)
}

/// Per-column numeric summary reported by KPI blocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NumericSummary {
    pub count: usize,
    pub null_count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub p10: Option<f64>,
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub p90: Option<f64>,
}

pub fn compute_numeric_summary(rows: &[Row], column: &str) -> NumericSummary {
    let mut nums = Vec::new();
    let mut null_count = 0usize;
    for row in rows {
        match row.get(column).and_then(parse_number) {
            Some(n) => nums.push(n),
            None => null_count += 1,
        }
    }
    nums.sort_by(f64::total_cmp);
    let count = nums.len();
    let mean = if count > 0 {
        Some(nums.iter().sum::<f64>() / count as f64)
    } else {
        None
    };
    NumericSummary {
        count,
        null_count,
        min: nums.first().copied(),
        max: nums.last().copied(),
        mean,
        p10: quantile(&nums, 0.10),
        p25: quantile(&nums, 0.25),
        p50: quantile(&nums, 0.50),
        p75: quantile(&nums, 0.75),
        p90: quantile(&nums, 0.90),
    }
}

/// Welford running mean/variance accumulator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Welford {
    pub n: usize,
    pub mean: f64,
    m2: f64,
}

impl Welford {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Sample variance; 0 for fewer than two observations.
    pub fn variance(&self) -> f64 {
        if self.n > 1 {
            self.m2 / (self.n - 1) as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_interpolate_linearly() {
        let vals = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&vals, 0.0), Some(1.0));
        assert_eq!(quantile(&vals, 1.0), Some(4.0));
        assert_eq!(quantile(&vals, 0.5), Some(2.5));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn quantiles_are_monotonic() {
        let vals = [5.0, 1.0, 9.0, 3.0, 7.0, 2.0];
        let mut sorted = vals.to_vec();
        sorted.sort_by(f64::total_cmp);
        let ps: Vec<f64> = [0.1, 0.25, 0.5, 0.75, 0.9]
            .iter()
            .map(|q| quantile(&sorted, *q).unwrap())
            .collect();
        for pair in ps.windows(2) {
            assert!(pair[0] <= pair[1], "quantiles must not decrease: {ps:?}");
        }
    }

    #[test]
    fn welford_matches_two_pass_variance() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut w = Welford::default();
        for x in xs {
            w.push(x);
        }
        let mean = xs.iter().sum::<f64>() / xs.len() as f64;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
        assert!((w.mean - mean).abs() < 1e-12);
        assert!((w.variance() - var).abs() < 1e-12);
    }
}
