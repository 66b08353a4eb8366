//! Event Sink: batches Anomaly Events and delivers them at least once.
//!
//! A batch is closed when it reaches `batch_size` events or when
//! `flush_interval` passes with events pending, whichever comes first.
//! Every batch is staged in the outbox before the first attempt and removed
//! on acknowledgement. A batch that fails `max_retry_attempts` times is
//! moved to the dead-letter store; it is never dropped.

pub mod bus;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::PipelineConfig;
use crate::detect::AnomalyEvent;
use crate::error::DeliveryError;
use crate::metrics::PipelineMetrics;
use crate::storage::dead_letter::DeadLetterStore;
use crate::storage::outbox::OutboxStore;
use memory::SharedMemory;

/// The unit of delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub batch_id: Uuid,
    pub events: Vec<AnomalyEvent>,
    pub created_at: DateTime<Utc>,
}

impl EventBatch {
    pub fn new(events: Vec<AnomalyEvent>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            events,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Batching and retry settings.
#[derive(Debug, Clone, Copy)]
pub struct SinkSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Total attempts per batch, first one included.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub delivery_timeout: Duration,
}

impl SinkSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            max_attempts: config.max_retry_attempts.max(1),
            backoff: Backoff::new(
                Duration::from_millis(config.retry_base_delay_ms),
                Duration::from_millis(config.retry_max_delay_ms),
            ),
            delivery_timeout: config.delivery_timeout(),
        }
    }
}

/// How one batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    DeadLettered { attempts: u32, error: String },
}

/// Result of a dead-letter replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct EventSink {
    memory: SharedMemory,
    outbox: OutboxStore,
    dead_letters: DeadLetterStore,
    metrics: Arc<PipelineMetrics>,
    settings: SinkSettings,
}

impl EventSink {
    pub fn new(
        memory: SharedMemory,
        outbox: OutboxStore,
        dead_letters: DeadLetterStore,
        metrics: Arc<PipelineMetrics>,
        settings: SinkSettings,
    ) -> Self {
        Self {
            memory,
            outbox,
            dead_letters,
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &SinkSettings {
        &self.settings
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    /// Consume events until every sender is dropped, then flush what is
    /// left and return.
    pub async fn run(&self, mut events: mpsc::Receiver<AnomalyEvent>) {
        info!(memory = self.memory.name(), batch_size = self.settings.batch_size, "event sink started");
        let mut pending: Vec<AnomalyEvent> = Vec::with_capacity(self.settings.batch_size);
        let mut flush = tokio::time::interval(self.settings.flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        flush.tick().await;

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Some(event) => {
                        pending.push(event);
                        if pending.len() >= self.settings.batch_size {
                            self.deliver(&EventBatch::new(std::mem::take(&mut pending))).await;
                            flush.reset();
                        }
                    }
                    None => break,
                },
                _ = flush.tick() => {
                    if !pending.is_empty() {
                        self.deliver(&EventBatch::new(std::mem::take(&mut pending))).await;
                    }
                }
            }
        }

        if !pending.is_empty() {
            self.deliver(&EventBatch::new(pending)).await;
        }
        info!("event sink stopped");
    }

    /// Stage, deliver with retries, then acknowledge or dead-letter.
    pub async fn deliver(&self, batch: &EventBatch) -> DeliveryOutcome {
        if let Err(e) = self.outbox.stage(batch) {
            error!(batch = %batch.batch_id, error = %e, "failed to stage batch in outbox");
        }

        match self.attempt_delivery(batch).await {
            Ok(attempts) => {
                if let Err(e) = self.outbox.ack(batch) {
                    error!(batch = %batch.batch_id, error = %e, "failed to clear delivered batch from outbox");
                }
                DeliveryOutcome::Delivered { attempts }
            }
            Err((attempts, e)) => {
                let reason = e.to_string();
                self.metrics.delivery_failures_total.inc();
                match self.dead_letters.record(batch, attempts, &reason) {
                    Ok(true) => {
                        self.metrics.dead_letters_total.inc();
                        error!(
                            batch = %batch.batch_id,
                            events = batch.len(),
                            attempts,
                            error = %reason,
                            "delivery failed; batch dead-lettered"
                        );
                    }
                    Ok(false) => {
                        warn!(batch = %batch.batch_id, "batch already dead-lettered");
                    }
                    Err(store_err) => {
                        // The outbox row survives, so the batch is retried on restart.
                        error!(batch = %batch.batch_id, error = %store_err, "failed to dead-letter batch");
                    }
                }
                DeliveryOutcome::DeadLettered { attempts, error: reason }
            }
        }
    }

    /// Up to `max_attempts` calls into the memory interface. Returns the
    /// attempt count on success, or the count and the last error.
    async fn attempt_delivery(&self, batch: &EventBatch) -> Result<u32, (u32, DeliveryError)> {
        let max = self.settings.max_attempts;
        let mut last = DeliveryError::Transport("not attempted".to_string());
        for attempt in 0..max {
            let result = tokio::time::timeout(
                self.settings.delivery_timeout,
                self.memory.ingest(&batch.events),
            )
            .await
            .unwrap_or(Err(DeliveryError::Timeout(self.settings.delivery_timeout)));

            match result {
                Ok(()) => {
                    self.metrics.batches_delivered_total.inc();
                    debug!(batch = %batch.batch_id, events = batch.len(), attempt, "batch delivered");
                    return Ok(attempt + 1);
                }
                Err(e) => {
                    warn!(batch = %batch.batch_id, attempt, error = %e, "delivery attempt failed");
                    last = e;
                    if attempt + 1 < max {
                        tokio::time::sleep(self.settings.backoff.delay(attempt)).await;
                    }
                }
            }
        }
        Err((max, last))
    }

    /// Deliver batches left in the outbox by a previous run.
    pub async fn replay_outbox(&self) -> anyhow::Result<usize> {
        let pending = self.outbox.pending()?;
        if !pending.is_empty() {
            info!(batches = pending.len(), "re-delivering batches from outbox");
        }
        for batch in &pending {
            self.deliver(batch).await;
        }
        Ok(pending.len())
    }

    /// Try each dead-lettered batch once more, oldest first. Delivered
    /// batches leave the dead-letter store; failures stay for later.
    pub async fn replay_dead_letters(&self, limit: usize) -> anyhow::Result<ReplayReport> {
        let mut report = ReplayReport::default();
        for letter in self.dead_letters.list(limit)? {
            match self.attempt_delivery(&letter.batch).await {
                Ok(_) => {
                    self.dead_letters.remove(letter.batch.batch_id)?;
                    report.delivered += 1;
                }
                Err((_, e)) => {
                    warn!(batch = %letter.batch.batch_id, error = %e, "dead-letter replay failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
