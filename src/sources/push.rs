//! Push-based adapter: external callbacks feed readings through a handle.

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;

use super::{MetricReading, MetricSample, SourceAdapter, SourceKind};
use crate::error::SourceError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("push buffer for source '{0}' is full")]
    Full(String),
    #[error("source '{0}' is disconnected")]
    Closed(String),
}

/// Cloneable callback handle given to whatever produces pushed readings.
#[derive(Debug, Clone)]
pub struct PushHandle {
    source_id: String,
    tx: mpsc::Sender<MetricReading>,
}

impl PushHandle {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Non-blocking push; fails when the adapter's buffer is full.
    pub fn push(&self, reading: MetricReading) -> Result<(), PushError> {
        self.tx.try_send(reading).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full(self.source_id.clone()),
            mpsc::error::TrySendError::Closed(_) => PushError::Closed(self.source_id.clone()),
        })
    }

    /// Push, waiting for buffer space.
    pub async fn send(&self, reading: MetricReading) -> Result<(), PushError> {
        self.tx
            .send(reading)
            .await
            .map_err(|_| PushError::Closed(self.source_id.clone()))
    }
}

/// Adapter backed by a bounded buffer that [`PushHandle`]s write into.
pub struct PushSource {
    source_id: String,
    tx: mpsc::Sender<MetricReading>,
    rx: mpsc::Receiver<MetricReading>,
}

impl PushSource {
    pub fn new(source_id: impl Into<String>, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        Self {
            source_id: source_id.into(),
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> PushHandle {
        PushHandle {
            source_id: self.source_id.clone(),
            tx: self.tx.clone(),
        }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for PushSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Push
    }

    async fn open(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn produce_samples(&mut self) -> BoxStream<'_, Result<MetricSample, SourceError>> {
        let source_id = self.source_id.clone();
        stream::unfold(&mut self.rx, move |rx| {
            let source_id = source_id.clone();
            async move {
                let reading = rx.recv().await?;
                Some((Ok(reading.into_sample(&source_id, Utc::now())), rx))
            }
        })
        .boxed()
    }

    async fn disconnect(&mut self) -> usize {
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    fn push_handle(&self) -> Option<PushHandle> {
        Some(self.handle())
    }
}
