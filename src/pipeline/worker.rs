//! Dispatcher and detection workers.
//!
//! The dispatcher is the only consumer of the admission queue. It shards
//! samples to workers by source, so every sample of one source is handled
//! by the same worker in queue order. Samples keep their admission slot
//! until a worker has run them through detection.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::detect::{AnomalyEvent, DetectorRegistry, Observation};
use crate::ingest::{Admitted, IngestionStage};
use crate::metrics::PipelineMetrics;
use crate::sources::MetricSample;
use crate::window::WindowStore;

/// Upper bound on samples one worker takes from its channel per pass.
const MAX_DRAIN: usize = 256;

pub(crate) fn shard_of(source_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    source_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Route queued samples to workers until `stop` fires, then close the
/// queue and forward whatever is still in it.
pub(crate) async fn dispatch(
    mut queue: mpsc::Receiver<Admitted>,
    workers: Vec<mpsc::Sender<Admitted>>,
    stop: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            s = queue.recv() => s,
        };
        let Some(sample) = next else { return };
        forward(&workers, sample).await;
    }

    queue.close();
    let mut drained = 0usize;
    while let Some(sample) = queue.recv().await {
        forward(&workers, sample).await;
        drained += 1;
    }
    debug!(drained, "admission queue drained");
}

async fn forward(workers: &[mpsc::Sender<Admitted>], sample: Admitted) {
    let shard = shard_of(&sample.source_id, workers.len());
    if workers[shard].send(sample).await.is_err() {
        error!(shard, "detection worker gone; sample lost");
    }
}

/// Feed samples through the Window Store and the registry.
///
/// Consecutive samples of one source with the same timestamp form one
/// evaluation pass, so a detector can correlate metrics of a single poll.
pub fn detect(
    windows: &WindowStore,
    registry: &DetectorRegistry,
    samples: Vec<MetricSample>,
) -> Vec<AnomalyEvent> {
    let mut events = Vec::new();
    let mut pass: Vec<Observation> = Vec::new();
    for sample in samples {
        let boundary = pass.last().is_some_and(|last| {
            last.sample.source_id != sample.source_id || last.sample.timestamp != sample.timestamp
        });
        if boundary {
            events.extend(registry.evaluate_pass(&pass));
            pass.clear();
        }
        let snapshot = windows.update(&sample);
        pass.push(Observation { sample, snapshot });
    }
    if !pass.is_empty() {
        events.extend(registry.evaluate_pass(&pass));
    }
    events
}

pub(crate) struct Worker {
    pub index: usize,
    pub windows: Arc<WindowStore>,
    pub registry: Arc<DetectorRegistry>,
    pub ingest: Arc<IngestionStage>,
    pub metrics: Arc<PipelineMetrics>,
    pub events: mpsc::Sender<AnomalyEvent>,
}

pub(crate) async fn run_worker(worker: Worker, mut samples: mpsc::Receiver<Admitted>) {
    let Worker {
        index,
        windows,
        registry,
        ingest,
        metrics,
        events,
    } = worker;
    info!(worker = index, "detection worker started");
    while let Some(first) = samples.recv().await {
        let mut batch = vec![first];
        while batch.len() < MAX_DRAIN {
            match samples.try_recv() {
                Ok(s) => batch.push(s),
                Err(_) => break,
            }
        }

        let count = batch.len() as u64;
        let (batch, slots): (Vec<_>, Vec<_>) = batch.into_iter().map(Admitted::into_parts).unzip();
        let started = Instant::now();
        let found = detect(&windows, &registry, batch);
        metrics
            .detection_latency_seconds
            .observe(started.elapsed().as_secs_f64());
        metrics.samples_processed_total.inc_by(count);
        drop(slots);
        ingest.refresh_queue_gauge();

        for event in found {
            if events.send(event).await.is_err() {
                error!(worker = index, "event sink gone; anomaly not delivered");
            }
        }
    }
    info!(worker = index, "detection worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectorConfig, StorageConfig, WindowConfig};
    use crate::detect::factory::DetectorFactory;
    use crate::storage::overflow::OverflowStore;
    use crate::storage::test_pool;
    use chrono::{Duration, Utc};

    #[test]
    fn test_shard_is_stable() {
        assert_eq!(shard_of("host-a", 4), shard_of("host-a", 4));
        assert!(shard_of("host-b", 4) < 4);
        assert_eq!(shard_of("anything", 1), 0);
    }

    #[test]
    fn test_detect_groups_by_source_and_timestamp() {
        let windows = WindowStore::new(WindowConfig {
            window_size: 50,
            min_samples: 10,
            ema_alpha: 0.1,
        });
        let mut det = DetectorConfig::new("stat", "statistical");
        det.options.correlate = Some(true);
        let registry = DetectorRegistry::from_config(&[det], &DetectorFactory::builtin()).unwrap();

        let start = Utc::now();
        let mut samples = Vec::new();
        for i in 0..40 {
            let ts = start + Duration::seconds(i);
            let v = if i % 2 == 0 { 10.0 } else { 12.0 };
            samples.push(MetricSample::new("host", "cpu", v, ts));
            samples.push(MetricSample::new("host", "mem", v, ts));
        }
        assert!(detect(&windows, &registry, samples).is_empty());

        let ts = start + Duration::seconds(40);
        let spike = vec![
            MetricSample::new("host", "cpu", 90.0, ts),
            MetricSample::new("host", "mem", 90.0, ts),
        ];
        let events = detect(&windows, &registry, spike);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].affected_metrics.len(), 2);
        assert!(events[0].correlation_id.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_drains_after_stop() {
        let (_dir, pool) = test_pool();
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let (stage, qrx) =
            IngestionStage::new(8, OverflowStore::new(pool, &StorageConfig::default()), metrics, 10)
                .unwrap();
        let (wtx, mut wrx) = mpsc::channel(8);
        for v in [1.0, 2.0, 3.0] {
            stage.submit(MetricSample::new("a", "cpu", v, Utc::now())).unwrap();
        }
        let stop = CancellationToken::new();
        stop.cancel();
        dispatch(qrx, vec![wtx], stop).await;
        let mut got = vec![];
        while let Ok(s) = wrx.try_recv() {
            got.push(s.value);
        }
        assert_eq!(got, vec![1.0, 2.0, 3.0]);
    }
}
