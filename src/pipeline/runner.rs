//! Source runner: keeps one adapter connected and feeds its samples into
//! the Ingestion Stage.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::FatalSignal;
use crate::error::SourceError;
use crate::health::SourceState;
use crate::ingest::IngestionStage;
use crate::metrics::DropReason;
use crate::sources::{BoxedSource, ConnectPolicy, MetricSample};

/// Why the sample stream stopped.
enum StreamEnd {
    Cancelled,
    Broken,
    Exhausted,
    Fatal,
}

pub(crate) struct SourceRunner {
    pub source: BoxedSource,
    pub policy: ConnectPolicy,
    pub ingest: Arc<IngestionStage>,
    pub states: Arc<DashMap<String, SourceState>>,
    pub shutdown: CancellationToken,
    pub fatal: FatalSignal,
    pub grace: Duration,
}

impl SourceRunner {
    fn set_state(&self, id: &str, state: SourceState) {
        let previous = self.states.insert(id.to_string(), state);
        if previous != Some(state) {
            match state {
                SourceState::Unavailable => warn!(source = %id, "source unavailable"),
                _ => info!(source = %id, state = ?state, "source state changed"),
            }
        }
    }

    /// Pump samples until `shutdown` fires or the stream ends for good.
    ///
    /// A stream that ended on its own is disconnected here and `None` is
    /// returned. Otherwise the adapter stays connected; call
    /// [`SourceRunner::disconnect`] once admitted samples have been drained.
    pub async fn run(mut self) -> Option<Self> {
        let id = self.source.source_id().to_string();

        loop {
            self.set_state(&id, SourceState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                r = self.source.connect(&self.policy) => r,
            };
            if let Err(e) = connected {
                self.set_state(&id, SourceState::Unavailable);
                warn!(source = %id, error = %e, "giving up for now; will retry");
                // Wait out one full backoff before starting over.
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.policy.backoff.max) => continue,
                }
            }
            self.set_state(&id, SourceState::Connected);

            match self.pump(&id).await {
                StreamEnd::Broken => continue,
                StreamEnd::Exhausted => {
                    self.close().await;
                    return None;
                }
                StreamEnd::Cancelled | StreamEnd::Fatal => break,
            }
        }
        Some(self)
    }

    /// Close the adapter within the grace period. Samples it still buffered
    /// are counted as shutdown drops.
    pub async fn disconnect(mut self) {
        self.close().await
    }

    async fn close(&mut self) {
        let id = self.source.source_id().to_string();
        let discarded = match tokio::time::timeout(self.grace, self.source.disconnect()).await {
            Ok(n) => n,
            Err(_) => {
                warn!(source = %id, "source did not disconnect within grace period");
                0
            }
        };
        if discarded > 0 {
            warn!(source = %id, discarded, "buffered samples discarded on disconnect");
            self.ingest
                .drop_sample(&id, DropReason::Shutdown, discarded as u64);
        }
        self.set_state(&id, SourceState::Stopped);
        debug!(source = %id, "source runner stopped");
    }

    async fn pump(&mut self, id: &str) -> StreamEnd {
        let mut stream = self.source.produce_samples();
        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    let flushed = flush_ready(&mut stream, &self.ingest, &self.fatal);
                    if flushed > 0 {
                        debug!(source = %id, flushed, "submitted buffered samples on stop");
                    }
                    return StreamEnd::Cancelled;
                }
                item = stream.next() => item,
            };
            match item {
                Some(Ok(sample)) => {
                    if let Err(e) = self.ingest.submit(sample) {
                        if e.is_fatal() {
                            self.fatal.trigger(e);
                            return StreamEnd::Fatal;
                        }
                        warn!(source = %id, error = %e, "sample rejected");
                    }
                }
                Some(Err(e)) => {
                    warn!(source = %id, error = %e, "source stream broke; reconnecting");
                    return StreamEnd::Broken;
                }
                None => {
                    info!(source = %id, "source stream ended");
                    return StreamEnd::Exhausted;
                }
            }
        }
    }
}

/// Submit every sample the stream can yield without waiting.
fn flush_ready(
    stream: &mut BoxStream<'_, Result<MetricSample, SourceError>>,
    ingest: &IngestionStage,
    fatal: &FatalSignal,
) -> usize {
    let mut flushed = 0;
    while let Some(Some(Ok(sample))) = stream.next().now_or_never() {
        flushed += 1;
        if let Err(e) = ingest.submit(sample) {
            if e.is_fatal() {
                fatal.trigger(e);
                break;
            }
        }
    }
    flushed
}
