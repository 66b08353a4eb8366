//! Statistical Detector: z-score, IQR and MAD rules, OR-combined.
//!
//! Every rule scores the new value against the baseline view of the
//! snapshot (the retained window without that value). A rule whose
//! dispersion estimate is ~0 never fires.
//!
//! Merge policy with `correlate = true`: within one evaluation pass, all
//! metrics of the same source sharing a timestamp that fire are merged into
//! one event. Groups are emitted in (source_id, timestamp) order, metrics
//! within a group in name order, so the output depends only on the pass.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{confidence, positive, AnomalyEvent, CommonOptions, Detector, Observation};
use crate::config::DetectorOptions;
use crate::error::ConfigError;
use crate::sources::MetricSample;
use crate::window::WindowSnapshot;

const EPSILON: f64 = 1e-9;

pub const ANOMALY_TYPE: &str = "statistical_outlier";

/// Per-metric outcome of the rules that fired.
#[derive(Debug, Clone)]
struct Finding {
    metric: String,
    value: f64,
    z_score: f64,
    predicted: f64,
    rules: BTreeMap<String, f64>,
    worst: f64,
    fill: f64,
}

pub struct StatisticalDetector {
    id: String,
    common: CommonOptions,
    std_dev_threshold: f64,
    use_iqr: bool,
    iqr_multiplier: f64,
    use_mad: bool,
    mad_threshold: f64,
    correlate: bool,
}

impl StatisticalDetector {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            common: CommonOptions::default(),
            std_dev_threshold: 3.0,
            use_iqr: false,
            iqr_multiplier: 1.5,
            use_mad: false,
            mad_threshold: 3.0,
            correlate: false,
        }
    }

    fn assess(&self, sample: &MetricSample, snapshot: &WindowSnapshot) -> Option<Finding> {
        let baseline = snapshot.require(self.common.min_samples).ok()?;
        let value = sample.value;
        let mut rules = BTreeMap::new();

        let z_score = if baseline.std_dev > EPSILON {
            (value - baseline.mean) / baseline.std_dev
        } else {
            0.0
        };
        if z_score.abs() > self.std_dev_threshold {
            rules.insert("zscore".to_string(), z_score.abs());
        }

        if self.use_iqr && baseline.count >= 4 {
            let iqr = baseline.iqr();
            if iqr > EPSILON {
                let lower = baseline.q1 - self.iqr_multiplier * iqr;
                let upper = baseline.q3 + self.iqr_multiplier * iqr;
                if value < lower || value > upper {
                    rules.insert("iqr".to_string(), (value - baseline.median).abs() / iqr);
                }
            }
        }

        if self.use_mad && baseline.count >= 3 && baseline.mad > EPSILON {
            let score = (value - baseline.median).abs() / baseline.mad;
            if score > self.mad_threshold {
                rules.insert("mad".to_string(), score);
            }
        }

        if rules.is_empty() {
            return None;
        }
        let worst = rules.values().copied().fold(0.0, f64::max);
        let predicted = if rules.contains_key("zscore") {
            baseline.mean
        } else {
            baseline.median
        };
        Some(Finding {
            metric: sample.metric_name.clone(),
            value,
            z_score: z_score.abs(),
            predicted,
            rules,
            worst,
            fill: snapshot.fill_factor(),
        })
    }

    fn build_event(
        &self,
        source_id: &str,
        timestamp: DateTime<Utc>,
        findings: Vec<Finding>,
    ) -> Option<AnomalyEvent> {
        let lead = findings
            .iter()
            .max_by(|a, b| a.worst.total_cmp(&b.worst))?
            .clone();
        let mut event = AnomalyEvent::new(&self.id, source_id, timestamp, ANOMALY_TYPE);
        event.severity = self.common.severity.classify(lead.worst);
        event.confidence = confidence(
            lead.worst,
            self.common.confidence_scale,
            lead.rules.len(),
            lead.fill,
        );
        if findings.len() > 1 {
            event.correlation_id = Some(format!("{source_id}@{}", timestamp.timestamp_millis()));
        }
        for f in findings {
            event.affected_metrics.insert(f.metric.clone());
            event.z_scores.insert(f.metric.clone(), f.z_score);
            event.raw_values.insert(f.metric.clone(), f.value);
            event.predicted_values.insert(f.metric.clone(), f.predicted);
            event.rule_scores.insert(f.metric, f.rules);
        }
        Some(event)
    }
}

impl Detector for StatisticalDetector {
    fn detector_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn configure(&mut self, options: &DetectorOptions) -> Result<(), ConfigError> {
        self.common = CommonOptions::parse(&self.id, options)?;
        self.std_dev_threshold =
            positive(&self.id, "std_dev_threshold", options.std_dev_threshold, 3.0)?;
        self.use_iqr = options.use_iqr.unwrap_or(false);
        self.iqr_multiplier = positive(&self.id, "iqr_multiplier", options.iqr_multiplier, 1.5)?;
        self.use_mad = options.use_mad.unwrap_or(false);
        self.mad_threshold = positive(&self.id, "mad_threshold", options.mad_threshold, 3.0)?;
        self.correlate = options.correlate.unwrap_or(false);
        Ok(())
    }

    fn subscriptions(&self) -> &[String] {
        &self.common.metrics
    }

    fn evaluate(&self, sample: &MetricSample, snapshot: &WindowSnapshot) -> Option<AnomalyEvent> {
        let finding = self.assess(sample, snapshot)?;
        self.build_event(&sample.source_id, sample.timestamp, vec![finding])
    }

    fn evaluate_pass(&self, pass: &[&Observation]) -> Vec<AnomalyEvent> {
        if !self.correlate {
            return pass
                .iter()
                .filter_map(|o| self.evaluate(&o.sample, &o.snapshot))
                .collect();
        }

        let mut groups: BTreeMap<(&str, DateTime<Utc>), Vec<Finding>> = BTreeMap::new();
        for o in pass {
            if let Some(f) = self.assess(&o.sample, &o.snapshot) {
                groups
                    .entry((o.sample.source_id.as_str(), o.sample.timestamp))
                    .or_default()
                    .push(f);
            }
        }
        groups
            .into_iter()
            .filter_map(|((source_id, ts), mut findings)| {
                findings.sort_by(|a, b| a.metric.cmp(&b.metric));
                self.build_event(source_id, ts, findings)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use crate::detect::Severity;
    use crate::window::WindowStore;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn detector(options: DetectorOptions) -> StatisticalDetector {
        let mut d = StatisticalDetector::new("stat");
        d.configure(&options).unwrap();
        d
    }

    fn feed(store: &WindowStore, metric: &str, values: &[f64]) {
        for (i, v) in values.iter().enumerate() {
            store.update(&MetricSample::new("host", metric, *v, ts(i as i64)));
        }
    }

    fn store(window_size: usize) -> WindowStore {
        WindowStore::new(WindowConfig {
            window_size,
            min_samples: 10,
            ema_alpha: 0.1,
        })
    }

    #[test]
    fn test_zscore_spike() {
        let store = store(100);
        let baseline: Vec<f64> = (0..100).map(|i| if i % 2 == 0 { 35.0 } else { 45.0 }).collect();
        feed(&store, "cpu_usage", &baseline);

        let sample = MetricSample::new("host", "cpu_usage", 95.0, ts(100));
        let snap = store.update(&sample);
        let event = detector(DetectorOptions::default())
            .evaluate(&sample, &snap)
            .expect("spike should fire");

        let z = event.z_scores["cpu_usage"];
        assert!((z - 11.0).abs() < 0.1, "z = {z}");
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.confidence, 1.0 * snap.fill_factor());
        assert!(event.rule_scores["cpu_usage"].contains_key("zscore"));
        assert_eq!(event.predicted_values["cpu_usage"], snap.baseline.unwrap().mean);
    }

    #[test]
    fn test_constant_baseline_never_fires_zscore() {
        let store = store(50);
        feed(&store, "m", &[10.0; 30]);
        let sample = MetricSample::new("host", "m", 1000.0, ts(31));
        let snap = store.update(&sample);
        assert!(detector(DetectorOptions::default())
            .evaluate(&sample, &snap)
            .is_none());
    }

    #[test]
    fn test_cold_start_guard() {
        let store = store(50);
        let d = detector(DetectorOptions::default());
        for i in 0..9 {
            let v = if i % 2 == 0 { 1.0 } else { 1e6 };
            let sample = MetricSample::new("host", "m", v, ts(i));
            let snap = store.update(&sample);
            assert!(d.evaluate(&sample, &snap).is_none());
        }
    }

    #[test]
    fn test_iqr_rule_without_zscore() {
        // 10x0, 90x45, 90x55, 10x100: mean 50, std ~16.5, Q1 45, Q3 55.
        let store = store(256);
        let mut values = vec![0.0; 10];
        values.extend(std::iter::repeat(45.0).take(90));
        values.extend(std::iter::repeat(55.0).take(90));
        values.extend(std::iter::repeat(100.0).take(10));
        feed(&store, "memory_usage", &values);

        let sample = MetricSample::new("host", "memory_usage", 75.0, ts(500));
        let snap = store.update(&sample);

        let plain = detector(DetectorOptions::default());
        assert!(plain.evaluate(&sample, &snap).is_none());

        let iqr = detector(DetectorOptions {
            use_iqr: Some(true),
            ..Default::default()
        });
        let event = iqr.evaluate(&sample, &snap).expect("iqr should fire");
        let rules = &event.rule_scores["memory_usage"];
        assert_eq!(rules.len(), 1);
        assert_eq!(rules["iqr"], 2.5);
        assert!(event.z_scores["memory_usage"] < 3.0);
        assert_eq!(event.predicted_values["memory_usage"], 50.0);
    }

    #[test]
    fn test_mad_rule() {
        let store = store(64);
        let values: Vec<f64> = (0..40).map(|i| 100.0 + (i % 5) as f64).collect();
        feed(&store, "lat", &values);
        let sample = MetricSample::new("host", "lat", 110.0, ts(99));
        let snap = store.update(&sample);
        let d = detector(DetectorOptions {
            use_mad: Some(true),
            std_dev_threshold: Some(100.0),
            ..Default::default()
        });
        let event = d.evaluate(&sample, &snap).expect("mad should fire");
        assert!(event.rule_scores["lat"]["mad"] > 3.0);
    }

    #[test]
    fn test_correlated_pass_merges_by_source_and_timestamp() {
        let store = store(100);
        let alt: Vec<f64> = (0..50).map(|i| if i % 2 == 0 { 35.0 } else { 45.0 }).collect();
        feed(&store, "cpu", &alt);
        feed(&store, "mem", &alt);

        let at = ts(1000);
        let cpu = MetricSample::new("host", "cpu", 95.0, at);
        let mem = MetricSample::new("host", "mem", 90.0, at);
        let pass = vec![
            Observation {
                snapshot: store.update(&mem),
                sample: mem,
            },
            Observation {
                snapshot: store.update(&cpu),
                sample: cpu,
            },
        ];
        let refs: Vec<&Observation> = pass.iter().collect();

        let merged = detector(DetectorOptions {
            correlate: Some(true),
            ..Default::default()
        })
        .evaluate_pass(&refs);
        assert_eq!(merged.len(), 1);
        let event = &merged[0];
        assert_eq!(
            event.affected_metrics.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["cpu", "mem"]
        );
        assert!(event.correlation_id.is_some());

        let split = detector(DetectorOptions::default()).evaluate_pass(&refs);
        assert_eq!(split.len(), 2);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut d = StatisticalDetector::new("stat");
        let err = d
            .configure(&DetectorOptions {
                std_dev_threshold: Some(0.0),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.reason.contains("std_dev_threshold"));
    }
}
