//! Per-key Window State: ring buffer, Welford moments, EMA, sorted copy.

use std::collections::VecDeque;

use super::stats::WindowStats;

/// Rolling history of one (source, metric) key.
///
/// Mean and M2 are maintained with Welford's update and its inverse on
/// eviction. Sliding removal slowly accumulates rounding error, so the
/// moments are recomputed from the buffer once per full window turnover.
#[derive(Debug, Clone)]
pub struct WindowState {
    capacity: usize,
    alpha: f64,
    values: VecDeque<f64>,
    sorted: Vec<f64>,
    mean: f64,
    m2: f64,
    ema: Option<f64>,
    evictions_since_resync: usize,
}

/// Result of admitting one value.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    /// Statistics after the value was admitted.
    pub current: WindowStats,
    /// Statistics of the retained history the value is compared against
    /// (window after eviction, before admission). `None` when empty.
    pub baseline: Option<WindowStats>,
    pub evicted: Option<f64>,
}

impl WindowState {
    pub fn new(capacity: usize, alpha: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            alpha,
            values: VecDeque::with_capacity(capacity),
            sorted: Vec::with_capacity(capacity),
            mean: 0.0,
            m2: 0.0,
            ema: None,
            evictions_since_resync: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    /// Evict the oldest value if full, then admit `value`.
    pub fn admit(&mut self, value: f64) -> Admission {
        let evicted = if self.values.len() == self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        let baseline = (!self.values.is_empty()).then(|| self.stats(self.ema.unwrap_or(value)));

        self.values.push_back(value);
        let n = self.values.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);

        let at = self.sorted.partition_point(|v| *v < value);
        self.sorted.insert(at, value);

        let ema = match self.ema {
            None => value,
            Some(prev) => self.alpha * value + (1.0 - self.alpha) * prev,
        };
        self.ema = Some(ema);

        if self.evictions_since_resync >= self.capacity {
            self.resync();
        }

        Admission {
            current: self.stats(ema),
            baseline,
            evicted,
        }
    }

    fn evict_oldest(&mut self) -> Option<f64> {
        let old = self.values.pop_front()?;
        let n = self.values.len();
        if n == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
        } else {
            let delta = old - self.mean;
            self.mean -= delta / n as f64;
            self.m2 -= delta * (old - self.mean);
            if self.m2 < 0.0 {
                self.m2 = 0.0;
            }
        }
        let at = self.sorted.partition_point(|v| *v < old);
        if at < self.sorted.len() {
            self.sorted.remove(at);
        }
        self.evictions_since_resync += 1;
        Some(old)
    }

    /// Two-pass recompute of the moments from the buffer.
    fn resync(&mut self) {
        let n = self.values.len();
        if n == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
        } else {
            let mean = self.values.iter().sum::<f64>() / n as f64;
            self.m2 = self.values.iter().map(|v| (v - mean).powi(2)).sum();
            self.mean = mean;
        }
        self.evictions_since_resync = 0;
    }

    fn stats(&self, ema: f64) -> WindowStats {
        WindowStats::compute(self.values.len(), self.mean, self.m2, ema, &self.sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        (mean, var)
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let mut w = WindowState::new(5, 0.5);
        for i in 0..37 {
            w.admit(i as f64);
            assert!(w.len() <= 5);
        }
        assert_eq!(w.values().collect::<Vec<_>>(), vec![32.0, 33.0, 34.0, 35.0, 36.0]);
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut w = WindowState::new(3, 0.5);
        w.admit(1.0);
        w.admit(2.0);
        w.admit(3.0);
        let a = w.admit(4.0);
        assert_eq!(a.evicted, Some(1.0));
        let baseline = a.baseline.unwrap();
        assert_eq!(baseline.count, 2);
        assert_eq!(baseline.mean, 2.5);
        assert_eq!(a.current.count, 3);
        assert_eq!(a.current.mean, 3.0);
    }

    #[test]
    fn test_sliding_moments_match_naive() {
        let mut w = WindowState::new(50, 0.1);
        let mut all = Vec::new();
        for i in 0..1000 {
            // Large offset exposes catastrophic cancellation in sum-of-squares.
            let v = 1e9 + ((i * 7919) % 113) as f64;
            all.push(v);
            let a = w.admit(v);
            let tail = &all[all.len().saturating_sub(50)..];
            let (mean, var) = naive(tail);
            assert!((a.current.mean - mean).abs() < 1e-3, "mean drift at {i}");
            assert!((a.current.variance - var).abs() < 1e-2 * var.max(1.0), "variance drift at {i}");
        }
    }

    #[test]
    fn test_ema_seeded_with_first_value() {
        let mut w = WindowState::new(10, 0.5);
        assert_eq!(w.admit(10.0).current.ema, 10.0);
        assert_eq!(w.admit(20.0).current.ema, 15.0);
        let a = w.admit(15.0);
        assert_eq!(a.baseline.unwrap().ema, 15.0);
        assert_eq!(a.current.ema, 15.0);
    }

    #[test]
    fn test_robust_stats_reflect_full_window() {
        let mut w = WindowState::new(4, 0.5);
        for v in [100.0, 1.0, 2.0, 3.0] {
            w.admit(v);
        }
        // 100 is evicted; the median must not remember it.
        let a = w.admit(4.0);
        assert_eq!(a.current.median, 2.5);
        assert_eq!(a.current.max, 4.0);
        assert_eq!(a.baseline.unwrap().median, 2.0);
    }

    #[test]
    fn test_first_admission_has_no_baseline() {
        let mut w = WindowState::new(4, 0.5);
        let a = w.admit(7.0);
        assert!(a.baseline.is_none());
        assert_eq!(a.current.variance, 0.0);
    }
}
