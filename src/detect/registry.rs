//! Detector Registry: metric-routed fan-out with per-detector isolation.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};

use super::factory::DetectorFactory;
use super::{AnomalyEvent, Detector, Observation};
use crate::config::DetectorConfig;
use crate::error::ConfigError;
use crate::metrics::PipelineMetrics;
use crate::sources::MetricSample;
use crate::window::WindowSnapshot;

#[derive(Debug, Default)]
struct DetectorStats {
    processed: AtomicU64,
    anomalies: AtomicU64,
    faults: AtomicU64,
    latency_nanos: AtomicU64,
    calls: AtomicU64,
}

struct Entry {
    detector: Box<dyn Detector>,
    active: AtomicBool,
    stats: DetectorStats,
}

/// Counters for one registered detector.
#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatsSnapshot {
    pub detector_id: String,
    pub version: String,
    pub active: bool,
    pub processed: u64,
    pub anomalies: u64,
    pub faults: u64,
    pub mean_latency_us: f64,
}

/// Holds the active detectors and routes observations to them.
///
/// Detectors are kept in registration order. `routes` maps a metric name
/// to the indices subscribed to it; detectors with no subscriptions see
/// every metric. A detector that panics is marked inactive and skipped
/// from then on; the rest keep running.
#[derive(Default)]
pub struct DetectorRegistry {
    entries: Vec<Entry>,
    routes: HashMap<String, Vec<usize>>,
    wildcard: Vec<usize>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count emitted anomalies and detector faults in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build every enabled detector in `configs`.
    pub fn from_config(
        configs: &[DetectorConfig],
        factory: &DetectorFactory,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for config in configs.iter().filter(|c| c.enabled) {
            registry.register(factory.build(config)?)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, detector: Box<dyn Detector>) -> Result<(), ConfigError> {
        let id = detector.detector_id().to_string();
        if self.entries.iter().any(|e| e.detector.detector_id() == id) {
            return Err(ConfigError::new(
                format!("detector '{id}'"),
                "already registered",
            ));
        }
        let idx = self.entries.len();
        if detector.subscriptions().is_empty() {
            self.wildcard.push(idx);
        } else {
            for metric in detector.subscriptions() {
                let subs = self.routes.entry(metric.clone()).or_default();
                if !subs.contains(&idx) {
                    subs.push(idx);
                }
            }
        }
        info!(
            detector = %id,
            version = detector.version(),
            metrics = ?detector.subscriptions(),
            "registered detector"
        );
        self.entries.push(Entry {
            detector,
            active: AtomicBool::new(true),
            stats: DetectorStats::default(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of detectors subscribed to `metric`, in registration order.
    pub fn subscribers(&self, metric: &str) -> Vec<&str> {
        self.route(metric)
            .into_iter()
            .map(|i| self.entries[i].detector.detector_id())
            .collect()
    }

    fn route(&self, metric: &str) -> Vec<usize> {
        let mut idx: Vec<usize> = self
            .routes
            .get(metric)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        idx.extend_from_slice(&self.wildcard);
        idx.sort_unstable();
        idx
    }

    /// Fan one sample out to its subscribers.
    pub fn evaluate(&self, sample: &MetricSample, snapshot: &WindowSnapshot) -> Vec<AnomalyEvent> {
        let observation = Observation {
            sample: sample.clone(),
            snapshot: snapshot.clone(),
        };
        self.evaluate_pass(std::slice::from_ref(&observation))
    }

    /// Fan a whole evaluation pass out. Each detector receives the subset of
    /// the pass it subscribes to, in pass order; detectors run in
    /// registration order, so the output order is deterministic.
    pub fn evaluate_pass(&self, pass: &[Observation]) -> Vec<AnomalyEvent> {
        let mut per_detector: BTreeMap<usize, Vec<&Observation>> = BTreeMap::new();
        for observation in pass {
            for idx in self.route(&observation.sample.metric_name) {
                per_detector.entry(idx).or_default().push(observation);
            }
        }

        let mut events = Vec::new();
        for (idx, batch) in per_detector {
            let entry = &self.entries[idx];
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            let started = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| entry.detector.evaluate_pass(&batch)));
            let elapsed = started.elapsed().as_nanos() as u64;

            entry.stats.calls.fetch_add(1, Ordering::Relaxed);
            entry.stats.latency_nanos.fetch_add(elapsed, Ordering::Relaxed);
            entry
                .stats
                .processed
                .fetch_add(batch.len() as u64, Ordering::Relaxed);

            match result {
                Ok(found) => {
                    if !found.is_empty() {
                        debug!(
                            detector = entry.detector.detector_id(),
                            count = found.len(),
                            "detector emitted anomalies"
                        );
                    }
                    entry
                        .stats
                        .anomalies
                        .fetch_add(found.len() as u64, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        for event in &found {
                            metrics
                                .anomalies_detected_total
                                .with_label_values(&[event.detector_id.as_str(), event.severity.as_str()])
                                .inc();
                        }
                    }
                    events.extend(found);
                }
                Err(_) => {
                    entry.stats.faults.fetch_add(1, Ordering::Relaxed);
                    entry.active.store(false, Ordering::Release);
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .detector_faults_total
                            .with_label_values(&[entry.detector.detector_id()])
                            .inc();
                    }
                    error!(
                        detector = entry.detector.detector_id(),
                        "detector panicked; disabled until restart"
                    );
                }
            }
        }
        events
    }

    /// detector_id -> active, for the health surface.
    pub fn health(&self) -> BTreeMap<String, bool> {
        self.entries
            .iter()
            .map(|e| {
                let active = e.active.load(Ordering::Acquire) && e.detector.health_check();
                (e.detector.detector_id().to_string(), active)
            })
            .collect()
    }

    pub fn stats(&self) -> Vec<DetectorStatsSnapshot> {
        self.entries
            .iter()
            .map(|e| {
                let calls = e.stats.calls.load(Ordering::Relaxed);
                let nanos = e.stats.latency_nanos.load(Ordering::Relaxed);
                DetectorStatsSnapshot {
                    detector_id: e.detector.detector_id().to_string(),
                    version: e.detector.version().to_string(),
                    active: e.active.load(Ordering::Acquire),
                    processed: e.stats.processed.load(Ordering::Relaxed),
                    anomalies: e.stats.anomalies.load(Ordering::Relaxed),
                    faults: e.stats.faults.load(Ordering::Relaxed),
                    mean_latency_us: if calls == 0 {
                        0.0
                    } else {
                        nanos as f64 / calls as f64 / 1_000.0
                    },
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectorOptions, WindowConfig};
    use crate::window::WindowStore;
    use chrono::Utc;

    /// Fires on every sufficient snapshot.
    struct Always {
        id: String,
        metrics: Vec<String>,
    }

    impl Detector for Always {
        fn detector_id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> &str {
            "test"
        }
        fn configure(&mut self, _: &DetectorOptions) -> Result<(), ConfigError> {
            Ok(())
        }
        fn subscriptions(&self) -> &[String] {
            &self.metrics
        }
        fn evaluate(&self, sample: &MetricSample, _: &WindowSnapshot) -> Option<AnomalyEvent> {
            Some(AnomalyEvent::new(&self.id, &sample.source_id, sample.timestamp, "always"))
        }
    }

    struct Panics;

    impl Detector for Panics {
        fn detector_id(&self) -> &str {
            "boom"
        }
        fn version(&self) -> &str {
            "test"
        }
        fn configure(&mut self, _: &DetectorOptions) -> Result<(), ConfigError> {
            Ok(())
        }
        fn subscriptions(&self) -> &[String] {
            &[]
        }
        fn evaluate(&self, _: &MetricSample, _: &WindowSnapshot) -> Option<AnomalyEvent> {
            panic!("detector bug")
        }
    }

    fn always(id: &str, metrics: &[&str]) -> Box<dyn Detector> {
        Box::new(Always {
            id: id.into(),
            metrics: metrics.iter().map(|m| m.to_string()).collect(),
        })
    }

    fn observe(store: &WindowStore, metric: &str) -> Observation {
        let sample = MetricSample::new("host", metric, 1.0, Utc::now());
        Observation {
            snapshot: store.update(&sample),
            sample,
        }
    }

    fn store() -> WindowStore {
        WindowStore::new(WindowConfig {
            window_size: 10,
            min_samples: 1,
            ema_alpha: 0.5,
        })
    }

    #[test]
    fn test_routing_respects_subscriptions_and_order() {
        let mut reg = DetectorRegistry::new();
        reg.register(always("cpu-only", &["cpu"])).unwrap();
        reg.register(always("all", &[])).unwrap();
        reg.register(always("mem-only", &["mem"])).unwrap();

        assert_eq!(reg.subscribers("cpu"), vec!["cpu-only", "all"]);
        assert_eq!(reg.subscribers("mem"), vec!["all", "mem-only"]);
        assert_eq!(reg.subscribers("disk"), vec!["all"]);

        let store = store();
        let events = reg.evaluate_pass(&[observe(&store, "mem")]);
        let ids: Vec<&str> = events.iter().map(|e| e.detector_id.as_str()).collect();
        assert_eq!(ids, vec!["all", "mem-only"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut reg = DetectorRegistry::new();
        reg.register(always("a", &[])).unwrap();
        assert!(reg.register(always("a", &["cpu"])).is_err());
    }

    #[test]
    fn test_panicking_detector_is_isolated() {
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let mut reg = DetectorRegistry::new().with_metrics(metrics.clone());
        reg.register(Box::new(Panics)).unwrap();
        reg.register(always("ok", &[])).unwrap();

        let store = store();
        let events = reg.evaluate_pass(&[observe(&store, "cpu")]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detector_id, "ok");

        let health = reg.health();
        assert!(!health["boom"]);
        assert!(health["ok"]);

        // Disabled detectors are skipped on later passes.
        reg.evaluate_pass(&[observe(&store, "cpu")]);
        let stats = reg.stats();
        assert_eq!(stats[0].faults, 1);
        assert_eq!(stats[0].processed, 1);
        assert_eq!(stats[1].processed, 2);
        assert_eq!(stats[1].anomalies, 2);
        assert_eq!(metrics.anomalies_total(), 2);
        assert_eq!(
            metrics.detector_faults_total.with_label_values(&["boom"]).get(),
            1
        );
    }

    #[test]
    fn test_from_config_skips_disabled() {
        let mut disabled = DetectorConfig::new("off", "statistical");
        disabled.enabled = false;
        let configs = vec![DetectorConfig::new("stat", "statistical"), disabled];
        let reg = DetectorRegistry::from_config(&configs, &DetectorFactory::builtin()).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.health().contains_key("stat"));
    }
}
