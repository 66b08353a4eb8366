//! Ingestion Stage: admission control between sources and detection.
//!
//! One bounded queue of `queue_capacity` samples. `submit` never waits:
//! a full queue spills the sample to the overflow store, and a failing or
//! full overflow store drops it with a counter increment.
//!
//! Capacity is counted in admission slots. A slot travels with its sample
//! as an [`Admitted`] and is freed only when detection has processed the
//! sample, so samples held by the dispatcher or a worker still count
//! against the bound.
//!
//! A source with samples still in the overflow store keeps spilling even
//! when the queue has room, so its samples reach detection in the order
//! they were produced. The recovery sweep drains that backlog oldest first.

pub mod sweep;

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use crate::error::{PipelineError, SpilloverError};
use crate::metrics::{DropReason, PipelineMetrics};
use crate::sources::MetricSample;
use crate::storage::overflow::OverflowStore;

/// Result of [`IngestionStage::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Spilled,
    Dropped,
}

/// Per-source admission counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounters {
    pub received: u64,
    pub accepted: u64,
    pub spilled: u64,
    pub dropped: u64,
}

/// A sample that holds one admission slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Admitted {
    sample: MetricSample,
    slot: OwnedSemaphorePermit,
}

impl Admitted {
    /// Split into the sample and the slot; the slot should be dropped once
    /// the sample has been processed.
    pub fn into_parts(self) -> (MetricSample, OwnedSemaphorePermit) {
        (self.sample, self.slot)
    }
}

impl Deref for Admitted {
    type Target = MetricSample;

    fn deref(&self) -> &MetricSample {
        &self.sample
    }
}

pub struct IngestionStage {
    tx: mpsc::Sender<Admitted>,
    slots: Arc<Semaphore>,
    capacity: usize,
    overflow: OverflowStore,
    metrics: Arc<PipelineMetrics>,
    /// Samples per source currently in the overflow store.
    backlog: DashMap<String, u64>,
    counters: DashMap<String, SourceCounters>,
    consecutive_store_failures: AtomicU64,
    max_consecutive_store_failures: u64,
    exhausted: AtomicBool,
}

impl IngestionStage {
    /// Create the stage and its queue. The receiver goes to the dispatcher.
    ///
    /// Any backlog left in the overflow store by a previous run is picked up
    /// here so ordering holds across restarts.
    pub fn new(
        capacity: usize,
        overflow: OverflowStore,
        metrics: Arc<PipelineMetrics>,
        max_consecutive_store_failures: u64,
    ) -> Result<(Self, mpsc::Receiver<Admitted>), SpilloverError> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let backlog = DashMap::new();
        for (source, pending) in overflow.pending_by_source()? {
            if pending > 0 {
                debug!(source = %source, pending, "resuming overflow backlog");
                backlog.insert(source, pending);
            }
        }
        metrics.overflow_depth.set(overflow.record_count()? as i64);

        let stage = Self {
            tx,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            overflow,
            metrics,
            backlog,
            counters: DashMap::new(),
            consecutive_store_failures: AtomicU64::new(0),
            max_consecutive_store_failures,
            exhausted: AtomicBool::new(false),
        };
        Ok((stage, rx))
    }

    /// Admit one sample without blocking.
    ///
    /// Returns `Err(ResourceExhausted)` once the overflow store has failed
    /// more than `max_consecutive_store_failures` times in a row while the
    /// queue was full; the sample itself is counted as dropped either way.
    pub fn submit(&self, sample: MetricSample) -> Result<SubmitOutcome, PipelineError> {
        self.bump(&sample.source_id, |c| c.received += 1);

        if !sample.value.is_finite() {
            warn!(source = %sample.source_id, metric = %sample.metric_name, "dropping non-finite sample");
            self.drop_sample(&sample.source_id, DropReason::NonFinite, 1);
            return Ok(SubmitOutcome::Dropped);
        }

        if self.backlog_of(&sample.source_id) > 0 {
            return self.spill(sample);
        }

        let admitted = match self.admit(sample) {
            Ok(admitted) => admitted,
            Err(sample) => return self.spill(sample),
        };
        let source_id = admitted.source_id.clone();
        match self.tx.try_send(admitted) {
            Ok(()) => {
                self.bump(&source_id, |c| c.accepted += 1);
                self.refresh_queue_gauge();
                Ok(SubmitOutcome::Accepted)
            }
            Err(TrySendError::Full(admitted)) => self.spill(admitted.into_parts().0),
            Err(TrySendError::Closed(_)) => {
                self.drop_sample(&source_id, DropReason::Shutdown, 1);
                Ok(SubmitOutcome::Dropped)
            }
        }
    }

    /// Bind `sample` to a free slot, or hand it back when none is left.
    fn admit(&self, sample: MetricSample) -> Result<Admitted, MetricSample> {
        match self.slots.clone().try_acquire_owned() {
            Ok(slot) => Ok(Admitted { sample, slot }),
            Err(_) => Err(sample),
        }
    }

    fn spill(&self, sample: MetricSample) -> Result<SubmitOutcome, PipelineError> {
        // Counted before the write so a concurrent sweep never sees the
        // record without its backlog entry.
        *self.backlog.entry(sample.source_id.clone()).or_insert(0) += 1;
        let written = self.overflow.append(&sample);
        if written.is_err() {
            self.release_backlog(&sample.source_id, 1);
        }
        match written {
            Ok(()) => {
                self.consecutive_store_failures.store(0, Ordering::Relaxed);
                self.metrics.spillover_writes_total.inc();
                self.bump(&sample.source_id, |c| c.spilled += 1);
                debug!(source = %sample.source_id, metric = %sample.metric_name, "spilled sample");
                Ok(SubmitOutcome::Spilled)
            }
            Err(SpilloverError::QuotaExceeded { records, limit }) => {
                warn!(source = %sample.source_id, records, limit, "overflow quota exceeded; dropping sample");
                self.drop_sample(&sample.source_id, DropReason::Quota, 1);
                Ok(SubmitOutcome::Dropped)
            }
            Err(e) => {
                self.drop_sample(&sample.source_id, DropReason::StoreError, 1);
                let consecutive = self.consecutive_store_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(source = %sample.source_id, error = %e, consecutive, "spillover failed; dropping sample");
                if consecutive > self.max_consecutive_store_failures {
                    if !self.exhausted.swap(true, Ordering::AcqRel) {
                        error!(consecutive, "queue full and overflow store unavailable");
                    }
                    return Err(PipelineError::ResourceExhausted { consecutive });
                }
                Ok(SubmitOutcome::Dropped)
            }
        }
    }

    fn bump(&self, source_id: &str, f: impl FnOnce(&mut SourceCounters)) {
        if let Some(mut c) = self.counters.get_mut(source_id) {
            f(c.value_mut());
            return;
        }
        let mut c = self.counters.entry(source_id.to_string()).or_default();
        f(c.value_mut());
    }

    /// Count `count` samples of `source_id` as dropped.
    pub fn drop_sample(&self, source_id: &str, reason: DropReason, count: u64) {
        if count == 0 {
            return;
        }
        self.metrics.record_drop(reason, count);
        self.bump(source_id, |c| c.dropped += count);
    }

    pub fn backlog_of(&self, source_id: &str) -> u64 {
        self.backlog.get(source_id).map(|b| *b).unwrap_or(0)
    }

    fn release_backlog(&self, source_id: &str, count: u64) {
        if let Some(mut b) = self.backlog.get_mut(source_id) {
            *b = b.saturating_sub(count);
        }
        self.backlog.remove_if(source_id, |_, b| *b == 0);
    }

    /// Admitted samples not yet processed by detection, wherever they
    /// are in memory.
    pub fn queue_depth(&self) -> usize {
        self.capacity
            .saturating_sub(self.slots.available_permits())
    }

    pub fn refresh_queue_gauge(&self) {
        self.metrics.queue_depth.set(self.queue_depth() as i64);
    }

    pub fn queue_capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow_depth(&self) -> usize {
        self.overflow.record_count().unwrap_or(0)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    pub fn source_counters(&self) -> BTreeMap<String, SourceCounters> {
        self.counters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Move spilled samples back into the queue while it has room.
    ///
    /// Expired records are purged first and counted as drops. Records are
    /// replayed oldest first; a record is deleted only once every sample in
    /// it is back in the queue, otherwise its unreplayed tail is kept.
    pub fn sweep_once(&self, expire_before: DateTime<Utc>) -> Result<SweepReport, SpilloverError> {
        let mut report = SweepReport::default();

        for (source, count) in self.overflow.purge_older_than(expire_before)? {
            warn!(source = %source, count, "overflow records expired; dropping samples");
            self.release_backlog(&source, count);
            self.drop_sample(&source, DropReason::Expired, count);
            report.expired += count;
        }

        while self.slots.available_permits() > 0 {
            let Some(record) = self.overflow.claim_oldest()? else {
                break;
            };
            let mut sent = 0usize;
            let mut closed = false;
            for sample in &record.samples {
                let Ok(admitted) = self.admit(sample.clone()) else {
                    break;
                };
                match self.tx.try_send(admitted) {
                    Ok(()) => sent += 1,
                    Err(TrySendError::Full(_)) => break,
                    Err(TrySendError::Closed(_)) => {
                        closed = true;
                        break;
                    }
                }
            }

            if sent == record.samples.len() {
                self.overflow.remove(record.id)?;
            } else if sent > 0 {
                self.overflow.retain(record.id, &record.samples[sent..])?;
            }
            if sent > 0 {
                self.release_backlog(&record.source_id, sent as u64);
                self.metrics.samples_replayed_total.inc_by(sent as u64);
                report.replayed += sent as u64;
            }
            if closed || sent < record.samples.len() {
                break;
            }
        }

        self.refresh_queue_gauge();
        self.metrics
            .overflow_depth
            .set(self.overflow.record_count()? as i64);
        Ok(report)
    }
}

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub replayed: u64,
    pub expired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::test_pool;

    fn stage(capacity: usize, max_records: usize) -> (tempfile::TempDir, IngestionStage, mpsc::Receiver<Admitted>, Arc<PipelineMetrics>) {
        let (dir, pool) = test_pool();
        let overflow = OverflowStore::new(
            pool,
            &StorageConfig {
                overflow_max_records: max_records,
                ..Default::default()
            },
        );
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let (stage, rx) = IngestionStage::new(capacity, overflow, metrics.clone(), 10).unwrap();
        (dir, stage, rx, metrics)
    }

    fn sample(source: &str, v: f64) -> MetricSample {
        MetricSample::new(source, "cpu", v, Utc::now())
    }

    fn far_past() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::days(365)
    }

    #[test]
    fn test_free_capacity_never_spills() {
        let (_dir, stage, _rx, metrics) = stage(4, 100);
        for i in 0..4 {
            assert_eq!(stage.submit(sample("a", i as f64)).unwrap(), SubmitOutcome::Accepted);
        }
        assert_eq!(metrics.spillover_writes_total.get(), 0);
        assert_eq!(stage.overflow_depth(), 0);
        assert_eq!(stage.queue_depth(), 4);
    }

    #[test]
    fn test_full_queue_spills_then_drops_on_quota() {
        let (_dir, stage, _rx, metrics) = stage(2, 1);
        stage.submit(sample("a", 1.0)).unwrap();
        stage.submit(sample("a", 2.0)).unwrap();
        assert_eq!(stage.submit(sample("a", 3.0)).unwrap(), SubmitOutcome::Spilled);
        assert_eq!(stage.submit(sample("a", 4.0)).unwrap(), SubmitOutcome::Dropped);
        assert_eq!(metrics.dropped(DropReason::Quota), 1);
        let c = &stage.source_counters()["a"];
        assert_eq!((c.received, c.spilled, c.dropped), (4, 1, 1));
    }

    #[test]
    fn test_non_finite_dropped() {
        let (_dir, stage, _rx, metrics) = stage(2, 10);
        assert_eq!(stage.submit(sample("a", f64::NAN)).unwrap(), SubmitOutcome::Dropped);
        assert_eq!(metrics.dropped(DropReason::NonFinite), 1);
    }

    #[test]
    fn test_backlog_keeps_source_order() {
        let (_dir, stage, mut rx, _metrics) = stage(2, 100);
        for i in 0..5 {
            stage.submit(sample("a", i as f64)).unwrap();
        }
        assert_eq!(stage.backlog_of("a"), 3);

        // Consumer frees one slot; the source still spills behind its backlog.
        assert_eq!(rx.try_recv().unwrap().value, 0.0);
        assert_eq!(stage.submit(sample("a", 5.0)).unwrap(), SubmitOutcome::Spilled);
        // Another source is unaffected.
        assert_eq!(stage.submit(sample("b", 0.0)).unwrap(), SubmitOutcome::Accepted);

        let mut seen = vec![];
        while seen.len() < 5 {
            stage.sweep_once(far_past()).unwrap();
            while let Ok(s) = rx.try_recv() {
                if s.source_id == "a" {
                    seen.push(s.value);
                }
            }
        }
        assert_eq!(seen, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(stage.backlog_of("a"), 0);
        assert_eq!(stage.submit(sample("a", 6.0)).unwrap(), SubmitOutcome::Accepted);
    }

    #[test]
    fn test_sweep_waits_for_capacity() {
        let (_dir, stage, mut rx, metrics) = stage(1, 100);
        stage.submit(sample("a", 1.0)).unwrap();
        stage.submit(sample("a", 2.0)).unwrap();
        assert_eq!(stage.sweep_once(far_past()).unwrap().replayed, 0);
        assert_eq!(stage.overflow_depth(), 1);

        rx.try_recv().unwrap();
        assert_eq!(stage.sweep_once(far_past()).unwrap().replayed, 1);
        assert_eq!(stage.overflow_depth(), 0);
        assert_eq!(metrics.samples_replayed_total.get(), 1);
    }

    #[test]
    fn test_expired_records_count_as_drops() {
        let (_dir, stage, _rx, metrics) = stage(1, 100);
        stage.submit(sample("a", 1.0)).unwrap();
        stage.submit(sample("a", 2.0)).unwrap();
        stage.submit(sample("a", 3.0)).unwrap();
        let report = stage
            .sweep_once(Utc::now() + chrono::Duration::seconds(5))
            .unwrap();
        assert_eq!(report.expired, 2);
        assert_eq!(metrics.dropped(DropReason::Expired), 2);
        assert_eq!(stage.backlog_of("a"), 0);
    }

    #[test]
    fn test_slot_held_until_sample_processed() {
        let (_dir, stage, mut rx, metrics) = stage(2, 100);
        stage.submit(sample("a", 1.0)).unwrap();
        stage.submit(sample("a", 2.0)).unwrap();

        // Out of the queue but not yet processed: still counted.
        let (first, slot) = rx.try_recv().unwrap().into_parts();
        assert_eq!(first.value, 1.0);
        assert_eq!(stage.queue_depth(), 2);
        assert_eq!(stage.submit(sample("b", 3.0)).unwrap(), SubmitOutcome::Spilled);
        assert_eq!(metrics.spillover_writes_total.get(), 1);

        drop(slot);
        assert_eq!(stage.queue_depth(), 1);
        assert_eq!(stage.submit(sample("c", 4.0)).unwrap(), SubmitOutcome::Accepted);
    }

    #[test]
    fn test_store_failures_exhaust_stage() {
        let (_dir, pool) = test_pool();
        let overflow = OverflowStore::new(pool.clone(), &StorageConfig::default());
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let (stage, _rx) = IngestionStage::new(1, overflow, metrics.clone(), 2).unwrap();
        pool.get().unwrap().execute_batch("DROP TABLE overflow").unwrap();

        assert_eq!(stage.submit(sample("a", 0.0)).unwrap(), SubmitOutcome::Accepted);
        assert_eq!(stage.submit(sample("a", 1.0)).unwrap(), SubmitOutcome::Dropped);
        assert_eq!(stage.submit(sample("a", 2.0)).unwrap(), SubmitOutcome::Dropped);
        assert!(!stage.is_exhausted());

        let err = stage.submit(sample("a", 3.0)).unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhausted { consecutive: 3 }));
        assert!(err.is_fatal());
        assert!(stage.is_exhausted());
        assert_eq!(metrics.dropped(DropReason::StoreError), 3);
        assert_eq!(stage.backlog_of("a"), 0);
    }

    #[test]
    fn test_restart_resumes_backlog() {
        let (dir, pool) = test_pool();
        let config = StorageConfig::default();
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        {
            let (stage, _rx) =
                IngestionStage::new(1, OverflowStore::new(pool.clone(), &config), metrics.clone(), 10)
                    .unwrap();
            stage.submit(sample("a", 1.0)).unwrap();
            stage.submit(sample("a", 2.0)).unwrap();
        }
        let (stage, mut rx) =
            IngestionStage::new(1, OverflowStore::new(pool, &config), metrics, 10).unwrap();
        assert_eq!(stage.backlog_of("a"), 1);
        assert_eq!(stage.submit(sample("a", 3.0)).unwrap(), SubmitOutcome::Spilled);
        stage.sweep_once(far_past()).unwrap();
        assert_eq!(rx.try_recv().unwrap().value, 2.0);
        drop(dir);
    }
}
