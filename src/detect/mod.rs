//! Anomaly Events and the pluggable detectors that produce them.

pub mod ema;
pub mod factory;
pub mod registry;
pub mod statistical;
pub mod threshold;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DetectorOptions;
use crate::error::ConfigError;
use crate::sources::MetricSample;
use crate::window::WindowSnapshot;

pub use registry::DetectorRegistry;

/// Severity levels for detected anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step function from score magnitude to [`Severity`].
///
/// A score strictly above `critical` is CRITICAL, above `high` HIGH, above
/// `medium` MEDIUM, anything else LOW.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            medium: 3.5,
            high: 4.0,
            critical: 5.0,
        }
    }
}

impl SeverityThresholds {
    pub fn classify(&self, score: f64) -> Severity {
        let score = score.abs();
        if score > self.critical {
            Severity::Critical
        } else if score > self.high {
            Severity::High
        } else if score > self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.medium > 0.0 && self.medium <= self.high && self.high <= self.critical) {
            return Err(format!(
                "severity thresholds must satisfy 0 < medium <= high <= critical (got {}/{}/{})",
                self.medium, self.high, self.critical
            ));
        }
        Ok(())
    }
}

/// Deterministic saturating confidence.
///
/// `min(1, worst / scale)`, boosted by 1.2 (still capped at 1) when more
/// than one rule agrees, then scaled by how full the baseline window is.
pub fn confidence(worst: f64, scale: f64, rules_agreeing: usize, fill_factor: f64) -> f64 {
    let mut c = (worst.abs() / scale).min(1.0);
    if rules_agreeing > 1 {
        c = (c * 1.2).min(1.0);
    }
    (c * fill_factor.clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

/// Options every built-in detector understands.
#[derive(Debug, Clone)]
pub(crate) struct CommonOptions {
    pub metrics: Vec<String>,
    pub min_samples: usize,
    pub severity: SeverityThresholds,
    pub confidence_scale: f64,
}

impl Default for CommonOptions {
    fn default() -> Self {
        Self {
            metrics: Vec::new(),
            min_samples: 0,
            severity: SeverityThresholds::default(),
            confidence_scale: 5.0,
        }
    }
}

impl CommonOptions {
    pub(crate) fn parse(detector_id: &str, options: &DetectorOptions) -> Result<Self, ConfigError> {
        let severity = options.severity_thresholds.unwrap_or_default();
        severity
            .validate()
            .map_err(|reason| ConfigError::new(format!("detector '{detector_id}'"), reason))?;
        Ok(Self {
            metrics: options.metrics.clone(),
            min_samples: options.min_samples.unwrap_or(0),
            severity,
            confidence_scale: positive(detector_id, "confidence_scale", options.confidence_scale, 5.0)?,
        })
    }
}

/// `value` or `default`, rejecting non-positive and non-finite settings.
pub(crate) fn positive(
    detector_id: &str,
    name: &str,
    value: Option<f64>,
    default: f64,
) -> Result<f64, ConfigError> {
    let v = value.unwrap_or(default);
    if !v.is_finite() || v <= 0.0 {
        return Err(ConfigError::new(
            format!("detector '{detector_id}'"),
            format!("{name} must be a positive number (got {v})"),
        ));
    }
    Ok(v)
}

/// A confirmed anomaly, immutable once built by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub event_id: Uuid,
    pub detector_id: String,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub confidence: f64,
    pub anomaly_type: String,
    pub affected_metrics: BTreeSet<String>,
    pub z_scores: BTreeMap<String, f64>,
    pub raw_values: BTreeMap<String, f64>,
    pub predicted_values: BTreeMap<String, f64>,
    /// metric -> rule name -> score, for every rule that fired.
    #[serde(default)]
    pub rule_scores: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl AnomalyEvent {
    pub fn new(
        detector_id: impl Into<String>,
        source_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        anomaly_type: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            detector_id: detector_id.into(),
            source_id: source_id.into(),
            timestamp,
            severity: Severity::Low,
            confidence: 0.0,
            anomaly_type: anomaly_type.into(),
            affected_metrics: BTreeSet::new(),
            z_scores: BTreeMap::new(),
            raw_values: BTreeMap::new(),
            predicted_values: BTreeMap::new(),
            rule_scores: BTreeMap::new(),
            correlation_id: None,
        }
    }

    /// Identity downstream consumers use to drop redelivered duplicates.
    pub fn dedup_key(&self) -> String {
        let metrics: Vec<&str> = self.affected_metrics.iter().map(String::as_str).collect();
        format!(
            "{}|{}|{}",
            self.detector_id,
            self.timestamp.to_rfc3339(),
            metrics.join(",")
        )
    }

    /// Record shape published to channel and HTTP consumers.
    pub fn to_ingest_record(&self) -> serde_json::Value {
        serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "source_id": self.source_id,
            "values": self.raw_values,
            "metadata": {
                "event_id": self.event_id,
                "detector_id": self.detector_id,
                "severity": self.severity,
                "confidence": self.confidence,
                "anomaly_type": self.anomaly_type,
                "affected_metrics": self.affected_metrics,
                "z_scores": self.z_scores,
                "predicted_values": self.predicted_values,
                "rule_scores": self.rule_scores,
                "correlation_id": self.correlation_id,
                "dedup_key": self.dedup_key(),
            }
        })
    }
}

/// A sample paired with the snapshot its window update produced.
#[derive(Debug, Clone)]
pub struct Observation {
    pub sample: MetricSample,
    pub snapshot: WindowSnapshot,
}

/// Detection capability. Implementations read snapshots only and never
/// touch Window State.
pub trait Detector: Send + Sync {
    fn detector_id(&self) -> &str;

    fn version(&self) -> &str;

    /// Apply options; invalid values are a startup-fatal [`ConfigError`].
    fn configure(&mut self, options: &DetectorOptions) -> Result<(), ConfigError>;

    /// Metric names this detector wants. Empty means every metric.
    fn subscriptions(&self) -> &[String];

    fn evaluate(&self, sample: &MetricSample, snapshot: &WindowSnapshot) -> Option<AnomalyEvent>;

    /// Evaluate everything in one pass. The default emits one event per
    /// observation; correlating detectors override this to merge.
    fn evaluate_pass(&self, pass: &[&Observation]) -> Vec<AnomalyEvent> {
        pass.iter()
            .filter_map(|o| self.evaluate(&o.sample, &o.snapshot))
            .collect()
    }

    fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_step_function() {
        let t = SeverityThresholds::default();
        assert_eq!(t.classify(3.1), Severity::Low);
        assert_eq!(t.classify(3.5), Severity::Low);
        assert_eq!(t.classify(3.6), Severity::Medium);
        assert_eq!(t.classify(4.2), Severity::High);
        assert_eq!(t.classify(-11.0), Severity::Critical);
        assert!(Severity::Critical > Severity::High);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(SeverityThresholds::default().validate().is_ok());
        let bad = SeverityThresholds {
            medium: 5.0,
            high: 4.0,
            critical: 6.0,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_confidence_saturates() {
        assert_eq!(confidence(11.0, 5.0, 1, 1.0), 1.0);
        assert!((confidence(4.2, 5.0, 1, 1.0) - 0.84).abs() < 1e-12);
        assert!((confidence(4.0, 5.0, 2, 1.0) - 0.96).abs() < 1e-12);
        assert!((confidence(4.0, 5.0, 1, 0.5) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_dedup_key_ignores_event_id() {
        let ts = Utc::now();
        let mut a = AnomalyEvent::new("stat", "host", ts, "statistical_outlier");
        a.affected_metrics.insert("mem".into());
        a.affected_metrics.insert("cpu".into());
        let mut b = a.clone();
        b.event_id = Uuid::new_v4();
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert!(a.dedup_key().ends_with("|cpu,mem"));
    }

    #[test]
    fn test_ingest_record_shape() {
        let mut e = AnomalyEvent::new("stat", "host", Utc::now(), "statistical_outlier");
        e.raw_values.insert("cpu".into(), 95.0);
        e.severity = Severity::High;
        let rec = e.to_ingest_record();
        assert_eq!(rec["source_id"], "host");
        assert_eq!(rec["values"]["cpu"], 95.0);
        assert_eq!(rec["metadata"]["severity"], "HIGH");
        assert_eq!(rec["metadata"]["detector_id"], "stat");
    }
}
