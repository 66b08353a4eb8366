//! Static bounds detector.

use super::{AnomalyEvent, CommonOptions, Detector};
use crate::config::DetectorOptions;
use crate::error::ConfigError;
use crate::sources::MetricSample;
use crate::window::WindowSnapshot;

pub const ANOMALY_TYPE: &str = "threshold_breach";

/// Fires when a value leaves `[min, max]`.
///
/// The score is the distance past the bound in baseline standard
/// deviations, or relative to the bound itself on a flat baseline.
/// Confidence starts at 0.5 for any breach and saturates towards 1.
pub struct ThresholdDetector {
    id: String,
    common: CommonOptions,
    min: Option<f64>,
    max: Option<f64>,
}

impl ThresholdDetector {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            common: CommonOptions::default(),
            min: None,
            max: None,
        }
    }

    fn breach(&self, value: f64) -> Option<f64> {
        match (self.min, self.max) {
            (Some(min), _) if value < min => Some(min),
            (_, Some(max)) if value > max => Some(max),
            _ => None,
        }
    }
}

impl Detector for ThresholdDetector {
    fn detector_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn configure(&mut self, options: &DetectorOptions) -> Result<(), ConfigError> {
        let component = format!("detector '{}'", self.id);
        self.common = CommonOptions::parse(&self.id, options)?;
        if options.min.is_none() && options.max.is_none() {
            return Err(ConfigError::new(component, "threshold detector needs min or max"));
        }
        if let (Some(min), Some(max)) = (options.min, options.max) {
            if min >= max {
                return Err(ConfigError::new(component, "min must be below max"));
            }
        }
        self.min = options.min;
        self.max = options.max;
        Ok(())
    }

    fn subscriptions(&self) -> &[String] {
        &self.common.metrics
    }

    fn evaluate(&self, sample: &MetricSample, snapshot: &WindowSnapshot) -> Option<AnomalyEvent> {
        snapshot.require(self.common.min_samples).ok()?;
        let bound = self.breach(sample.value)?;

        let excess = (sample.value - bound).abs();
        let scale = snapshot
            .baseline
            .map(|b| b.std_dev)
            .filter(|s| *s > 1e-9)
            .unwrap_or_else(|| bound.abs().max(1.0));
        let score = excess / scale;

        let metric = sample.metric_name.clone();
        let mut event = AnomalyEvent::new(&self.id, &sample.source_id, sample.timestamp, ANOMALY_TYPE);
        event.severity = self.common.severity.classify(score);
        event.confidence = 0.5 + 0.5 * (score / self.common.confidence_scale).min(1.0);
        event.affected_metrics.insert(metric.clone());
        event.z_scores.insert(metric.clone(), score);
        event.raw_values.insert(metric.clone(), sample.value);
        event.predicted_values.insert(metric.clone(), bound);
        event
            .rule_scores
            .insert(metric, [("threshold".to_string(), score)].into_iter().collect());
        Some(event)
    }
}
