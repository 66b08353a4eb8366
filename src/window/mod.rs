//! Window Store: rolling per-(source, metric) history and statistics.
//!
//! `WindowStore::update` is the only mutator. Each key lives in a DashMap
//! entry, so updates to one key are serialized by its shard lock while
//! distinct keys proceed in parallel across workers.

pub mod state;
pub mod stats;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::WindowConfig;
use crate::error::PipelineError;
use crate::sources::MetricSample;

pub use state::{Admission, WindowState};
pub use stats::WindowStats;

/// (source_id, metric_name)
pub type WindowKey = (String, String);

/// Statistics for one key immediately after admitting a sample.
#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    pub source_id: String,
    pub metric_name: String,
    pub window_size: usize,
    pub min_samples: usize,
    /// Set while the window holds fewer than `min_samples` values.
    pub insufficient_history: bool,
    /// State after admission.
    pub current: WindowStats,
    /// Retained history excluding the admitted value; what scores are
    /// computed against.
    pub baseline: Option<WindowStats>,
}

impl WindowSnapshot {
    pub fn len(&self) -> usize {
        self.current.count
    }

    pub fn is_empty(&self) -> bool {
        self.current.count == 0
    }

    pub fn mean(&self) -> f64 {
        self.current.mean
    }

    pub fn variance(&self) -> f64 {
        self.current.variance
    }

    pub fn std_dev(&self) -> f64 {
        self.current.std_dev
    }

    pub fn ema(&self) -> f64 {
        self.current.ema
    }

    /// Baseline stats, or `InsufficientHistory` while fewer than `needed`
    /// values have been observed.
    pub fn require(&self, needed: usize) -> Result<&WindowStats, PipelineError> {
        let needed = needed.max(self.min_samples);
        match &self.baseline {
            Some(b) if !self.insufficient_history && self.current.count >= needed => Ok(b),
            _ => Err(PipelineError::InsufficientHistory {
                needed,
                have: self.current.count,
            }),
        }
    }

    /// Fraction of the configured window the baseline covers.
    pub fn fill_factor(&self) -> f64 {
        let have = self.baseline.map(|b| b.count).unwrap_or(0);
        (have as f64 / self.window_size.max(1) as f64).min(1.0)
    }
}

pub struct WindowStore {
    config: WindowConfig,
    windows: DashMap<WindowKey, WindowState>,
}

impl WindowStore {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Admit `sample` into its key's window and return the fresh snapshot.
    pub fn update(&self, sample: &MetricSample) -> WindowSnapshot {
        let key = (sample.source_id.clone(), sample.metric_name.clone());
        let admission = {
            let mut state = self
                .windows
                .entry(key)
                .or_insert_with(|| WindowState::new(self.config.window_size, self.config.ema_alpha));
            state.admit(sample.value)
        };
        let Admission {
            current, baseline, ..
        } = admission;
        WindowSnapshot {
            source_id: sample.source_id.clone(),
            metric_name: sample.metric_name.clone(),
            window_size: self.config.window_size,
            min_samples: self.config.min_samples,
            insufficient_history: current.count < self.config.min_samples,
            current,
            baseline,
        }
    }

    /// Current length of a key's window (0 if unseen).
    pub fn window_len(&self, source_id: &str, metric_name: &str) -> usize {
        self.windows
            .get(&(source_id.to_string(), metric_name.to_string()))
            .map(|w| w.len())
            .unwrap_or(0)
    }

    /// Copy of a key's retained values, oldest first.
    pub fn values(&self, source_id: &str, metric_name: &str) -> Vec<f64> {
        self.windows
            .get(&(source_id.to_string(), metric_name.to_string()))
            .map(|w| w.values().collect())
            .unwrap_or_default()
    }

    pub fn key_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(source: impl Into<String>, metric: impl Into<String>, value: f64) -> MetricSample {
        MetricSample::new(source, metric, value, Utc::now())
    }

    fn store(window_size: usize, min_samples: usize) -> WindowStore {
        WindowStore::new(WindowConfig {
            window_size,
            min_samples,
            ema_alpha: 0.5,
        })
    }

    #[test]
    fn test_insufficient_history_until_min_samples() {
        let store = store(20, 10);
        for i in 1..=9 {
            let snap = store.update(&sample("s", "m", i as f64));
            assert!(snap.insufficient_history, "update {i}");
            assert!(matches!(
                snap.require(0),
                Err(PipelineError::InsufficientHistory { needed: 10, have }) if have == i
            ));
        }
        let snap = store.update(&sample("s", "m", 10.0));
        assert!(!snap.insufficient_history);
        assert_eq!(snap.require(0).unwrap().count, 9);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = store(3, 1);
        for v in [1.0, 2.0, 3.0, 4.0] {
            store.update(&sample("a", "cpu", v));
        }
        store.update(&sample("b", "cpu", 100.0));
        store.update(&sample("a", "mem", 7.0));
        assert_eq!(store.values("a", "cpu"), vec![2.0, 3.0, 4.0]);
        assert_eq!(store.values("b", "cpu"), vec![100.0]);
        assert_eq!(store.window_len("a", "mem"), 1);
        assert_eq!(store.key_count(), 3);
    }

    #[test]
    fn test_snapshot_reflects_state_after_admission() {
        let store = store(10, 1);
        store.update(&sample("s", "m", 2.0));
        let snap = store.update(&sample("s", "m", 4.0));
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.mean(), 3.0);
        assert_eq!(snap.variance(), 1.0);
        assert_eq!(snap.ema(), 3.0);
        assert_eq!(snap.baseline.unwrap().mean, 2.0);
        assert!((snap.fill_factor() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_parallel_updates_keep_bound() {
        let store = std::sync::Arc::new(store(16, 1));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let metric = format!("m{}", i % 3);
                        store.update(&sample(format!("s{t}"), metric, i as f64));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..4 {
            for m in 0..3 {
                assert_eq!(store.window_len(&format!("s{t}"), &format!("m{m}")), 16);
            }
        }
    }
}
