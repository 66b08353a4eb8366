//! EMA trend detector.
//!
//! Flags a value whose distance from the previous EMA exceeds
//! `deviation_threshold` baseline standard deviations.

use super::{confidence, positive, AnomalyEvent, CommonOptions, Detector};
use crate::config::DetectorOptions;
use crate::error::ConfigError;
use crate::sources::MetricSample;
use crate::window::WindowSnapshot;

pub const ANOMALY_TYPE: &str = "trend_deviation";

pub struct EmaDetector {
    id: String,
    common: CommonOptions,
    deviation_threshold: f64,
}

impl EmaDetector {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            common: CommonOptions::default(),
            deviation_threshold: 3.0,
        }
    }
}

impl Detector for EmaDetector {
    fn detector_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn configure(&mut self, options: &DetectorOptions) -> Result<(), ConfigError> {
        self.common = CommonOptions::parse(&self.id, options)?;
        self.deviation_threshold = positive(
            &self.id,
            "deviation_threshold",
            options.deviation_threshold,
            3.0,
        )?;
        Ok(())
    }

    fn subscriptions(&self) -> &[String] {
        &self.common.metrics
    }

    fn evaluate(&self, sample: &MetricSample, snapshot: &WindowSnapshot) -> Option<AnomalyEvent> {
        let baseline = snapshot.require(self.common.min_samples).ok()?;
        if baseline.std_dev <= 1e-9 {
            return None;
        }
        // baseline.ema is the EMA before this value was folded in
        let deviation = (sample.value - baseline.ema).abs() / baseline.std_dev;
        if deviation <= self.deviation_threshold {
            return None;
        }

        let metric = sample.metric_name.clone();
        let mut event = AnomalyEvent::new(&self.id, &sample.source_id, sample.timestamp, ANOMALY_TYPE);
        event.severity = self.common.severity.classify(deviation);
        event.confidence = confidence(
            deviation,
            self.common.confidence_scale,
            1,
            snapshot.fill_factor(),
        );
        event.affected_metrics.insert(metric.clone());
        event.z_scores.insert(metric.clone(), deviation);
        event.raw_values.insert(metric.clone(), sample.value);
        event.predicted_values.insert(metric.clone(), baseline.ema);
        event
            .rule_scores
            .insert(metric, [("ema".to_string(), deviation)].into_iter().collect());
        Some(event)
    }
}
