//! Order statistics over a sorted buffer.

use serde::Serialize;

/// Linear interpolation between closest ranks; `sorted` must be ascending.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Median absolute deviation around `median`.
pub fn mad_sorted(sorted: &[f64], median: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let mut deviations: Vec<f64> = sorted.iter().map(|v| (v - median).abs()).collect();
    deviations.sort_by(f64::total_cmp);
    quantile_sorted(&deviations, 0.5)
}

/// Point-in-time statistics of one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowStats {
    pub count: usize,
    pub mean: f64,
    /// Population variance.
    pub variance: f64,
    pub std_dev: f64,
    pub ema: f64,
    pub min: f64,
    pub max: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub mad: f64,
}

impl WindowStats {
    pub(crate) fn compute(count: usize, mean: f64, m2: f64, ema: f64, sorted: &[f64]) -> Self {
        let variance = if count > 0 { (m2 / count as f64).max(0.0) } else { 0.0 };
        let median = quantile_sorted(sorted, 0.5);
        Self {
            count,
            mean,
            variance,
            std_dev: variance.sqrt(),
            ema,
            min: sorted.first().copied().unwrap_or(f64::NAN),
            max: sorted.last().copied().unwrap_or(f64::NAN),
            q1: quantile_sorted(sorted, 0.25),
            median,
            q3: quantile_sorted(sorted, 0.75),
            mad: mad_sorted(sorted, median),
        }
    }

    pub fn iqr(&self) -> f64 {
        self.q3 - self.q1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantiles_interpolate() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile_sorted(&v, 0.5), 2.5);
        assert_eq!(quantile_sorted(&v, 0.25), 1.75);
        assert_eq!(quantile_sorted(&v, 0.75), 3.25);
        assert_eq!(quantile_sorted(&v, 0.0), 1.0);
        assert_eq!(quantile_sorted(&v, 1.0), 4.0);
        assert!(quantile_sorted(&[], 0.5).is_nan());
    }

    #[test]
    fn test_mad() {
        // median 3, deviations 2,1,0,1,2 -> MAD 1
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(mad_sorted(&v, 3.0), 1.0);
    }

    #[test]
    fn test_compute_population_variance() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        // mean 3, m2 = 4+1+0+1+4 = 10
        let s = WindowStats::compute(5, 3.0, 10.0, 3.0, &sorted);
        assert_eq!(s.variance, 2.0);
        assert!((s.std_dev - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(s.iqr(), 2.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 5.0);
    }
}
