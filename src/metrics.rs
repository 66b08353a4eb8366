//! Prometheus metrics for the pipeline.
//!
//! One [`PipelineMetrics`] is created at startup and handed to every
//! component as an `Arc`; it owns a private registry prefixed `anomalyd`.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Why a sample was dropped; the `reason` label of `samples_dropped_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Overflow store at `overflow_max_records`.
    Quota,
    /// Overflow store could not be written.
    StoreError,
    NonFinite,
    /// Overflow record outlived `overflow_ttl_secs`.
    Expired,
    /// Discarded while sources were torn down.
    Shutdown,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Quota => "quota",
            DropReason::StoreError => "store_error",
            DropReason::NonFinite => "non_finite",
            DropReason::Expired => "expired",
            DropReason::Shutdown => "shutdown",
        }
    }

    const ALL: [DropReason; 5] = [
        DropReason::Quota,
        DropReason::StoreError,
        DropReason::NonFinite,
        DropReason::Expired,
        DropReason::Shutdown,
    ];
}

pub struct PipelineMetrics {
    registry: Registry,
    pub samples_processed_total: IntCounter,
    pub anomalies_detected_total: IntCounterVec,
    pub detection_latency_seconds: Histogram,
    samples_dropped_total: IntCounterVec,
    pub spillover_writes_total: IntCounter,
    pub samples_replayed_total: IntCounter,
    pub delivery_failures_total: IntCounter,
    pub batches_delivered_total: IntCounter,
    pub dead_letters_total: IntCounter,
    pub detector_faults_total: IntCounterVec,
    pub queue_depth: IntGauge,
    pub overflow_depth: IntGauge,
}

impl PipelineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Self::with_prefix("anomalyd")
    }

    pub fn with_prefix(prefix: &str) -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some(prefix.to_string()), None)?;

        let samples_processed_total = IntCounter::new(
            "samples_processed_total",
            "Samples run through the window store and detectors",
        )?;
        registry.register(Box::new(samples_processed_total.clone()))?;

        let anomalies_detected_total = IntCounterVec::new(
            Opts::new("anomalies_detected_total", "Anomaly events emitted"),
            &["detector_id", "severity"],
        )?;
        registry.register(Box::new(anomalies_detected_total.clone()))?;

        let detection_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "detection_latency_seconds",
                "Window update plus detector fan-out time per sample",
            )
            .buckets(vec![
                0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1,
            ]),
        )?;
        registry.register(Box::new(detection_latency_seconds.clone()))?;

        let samples_dropped_total = IntCounterVec::new(
            Opts::new("samples_dropped_total", "Samples dropped, by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(samples_dropped_total.clone()))?;

        let spillover_writes_total = IntCounter::new(
            "spillover_writes_total",
            "Samples written to the overflow store",
        )?;
        registry.register(Box::new(spillover_writes_total.clone()))?;

        let samples_replayed_total = IntCounter::new(
            "samples_replayed_total",
            "Samples moved from the overflow store back into the queue",
        )?;
        registry.register(Box::new(samples_replayed_total.clone()))?;

        let delivery_failures_total = IntCounter::new(
            "delivery_failures_total",
            "Batches that exhausted every delivery attempt",
        )?;
        registry.register(Box::new(delivery_failures_total.clone()))?;

        let batches_delivered_total = IntCounter::new(
            "batches_delivered_total",
            "Batches acknowledged by the memory system",
        )?;
        registry.register(Box::new(batches_delivered_total.clone()))?;

        let dead_letters_total = IntCounter::new(
            "dead_letters_total",
            "Batches written to the dead-letter store",
        )?;
        registry.register(Box::new(dead_letters_total.clone()))?;

        let detector_faults_total = IntCounterVec::new(
            Opts::new("detector_faults_total", "Detector evaluations that panicked"),
            &["detector_id"],
        )?;
        registry.register(Box::new(detector_faults_total.clone()))?;

        let queue_depth = IntGauge::new("queue_depth", "Admitted samples not yet processed by detection")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let overflow_depth = IntGauge::new("overflow_depth", "Records in the overflow store")?;
        registry.register(Box::new(overflow_depth.clone()))?;

        // Pre-create every reason so all series export from the start.
        for reason in DropReason::ALL {
            samples_dropped_total.with_label_values(&[reason.as_str()]);
        }

        Ok(Self {
            registry,
            samples_processed_total,
            anomalies_detected_total,
            detection_latency_seconds,
            samples_dropped_total,
            spillover_writes_total,
            samples_replayed_total,
            delivery_failures_total,
            batches_delivered_total,
            dead_letters_total,
            detector_faults_total,
            queue_depth,
            overflow_depth,
        })
    }

    pub fn record_drop(&self, reason: DropReason, count: u64) {
        self.samples_dropped_total
            .with_label_values(&[reason.as_str()])
            .inc_by(count);
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.samples_dropped_total
            .with_label_values(&[reason.as_str()])
            .get()
    }

    /// Drops across every reason.
    pub fn dropped_total(&self) -> u64 {
        DropReason::ALL.iter().map(|r| self.dropped(*r)).sum()
    }

    pub fn anomalies_total(&self) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|f| f.get_name().ends_with("anomalies_detected_total"))
            .flat_map(|f| f.get_metric().iter())
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_uses_prefix() {
        let m = PipelineMetrics::new().unwrap();
        m.samples_processed_total.inc();
        m.spillover_writes_total.inc_by(5);
        let out = m.export().unwrap();
        assert!(out.contains("anomalyd_samples_processed_total 1"));
        assert!(out.contains("anomalyd_spillover_writes_total 5"));
        assert!(out.contains("anomalyd_samples_dropped_total{reason=\"quota\"} 0"));
    }

    #[test]
    fn test_drop_accounting() {
        let m = PipelineMetrics::new().unwrap();
        m.record_drop(DropReason::Quota, 2);
        m.record_drop(DropReason::Expired, 3);
        assert_eq!(m.dropped(DropReason::Quota), 2);
        assert_eq!(m.dropped_total(), 5);
    }

    #[test]
    fn test_anomalies_total_sums_labels() {
        let m = PipelineMetrics::new().unwrap();
        m.anomalies_detected_total
            .with_label_values(&["stat", "HIGH"])
            .inc();
        m.anomalies_detected_total
            .with_label_values(&["iqr", "LOW"])
            .inc_by(2);
        assert_eq!(m.anomalies_total(), 3);
    }

    #[test]
    fn test_independent_registries() {
        let a = PipelineMetrics::new().unwrap();
        let b = PipelineMetrics::new().unwrap();
        a.delivery_failures_total.inc();
        assert_eq!(b.delivery_failures_total.get(), 0);
    }
}
