//! Source Adapters: normalize external feeds into [`MetricSample`]s.
//!
//! An adapter is either pull-based ([`poll::PollSource`] driving a
//! [`poll::Poller`]) or push-based ([`push::PushSource`] fed through a
//! [`push::PushHandle`]). The pipeline only sees the [`SourceAdapter`]
//! capability.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::SourceError;

pub mod factory;
pub mod http;
pub mod poll;
pub mod push;
pub mod system;

/// The atomic unit flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub source_id: String,
    pub metric_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(
        source_id: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            metric_name: metric_name.into(),
            value,
            timestamp,
        }
    }
}

/// A value as read from a feed, before it is bound to a source.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricReading {
    pub metric_name: String,
    pub value: f64,
    /// Feed-supplied timestamp, if any.
    pub timestamp: Option<DateTime<Utc>>,
}

impl MetricReading {
    pub fn new(metric_name: impl Into<String>, value: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            value,
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Bind to a source, stamping `now` when the feed gave no timestamp.
    pub fn into_sample(self, source_id: &str, now: DateTime<Utc>) -> MetricSample {
        MetricSample {
            source_id: source_id.to_string(),
            metric_name: self.metric_name,
            value: self.value,
            timestamp: self.timestamp.unwrap_or(now),
        }
    }
}

/// Whether the adapter pulls on an interval or is fed by callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Poll,
    Push,
}

/// Reconnect policy applied by [`SourceAdapter::connect`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl ConnectPolicy {
    pub fn new(attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Backoff::new(base, max),
        }
    }
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(250), Duration::from_secs(10))
    }
}

/// Capability shared by every feed.
#[async_trait::async_trait]
pub trait SourceAdapter: Send {
    fn source_id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// One attempt at establishing the external channel.
    async fn open(&mut self) -> Result<(), SourceError>;

    /// Lazy, unbounded sequence of samples until disconnect. An `Err` item
    /// means the channel broke; the caller reconnects before polling again.
    fn produce_samples(&mut self) -> BoxStream<'_, Result<MetricSample, SourceError>>;

    /// Close the channel. Returns the number of buffered samples discarded.
    async fn disconnect(&mut self) -> usize;

    /// Handle for feeding a push-based adapter.
    fn push_handle(&self) -> Option<push::PushHandle> {
        None
    }

    /// Establish the channel, retrying with exponential backoff.
    ///
    /// Fails with [`SourceError::Unavailable`] after `policy.attempts`
    /// failed opens. Calling it again after that restarts the adapter.
    async fn connect(&mut self, policy: &ConnectPolicy) -> Result<(), SourceError> {
        let mut last_error = String::new();
        for attempt in 0..policy.attempts {
            match self.open().await {
                Ok(()) => {
                    debug!(source = %self.source_id(), attempt, "source connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(source = %self.source_id(), attempt, error = %e, "source connect failed");
                    last_error = e.to_string();
                    if attempt + 1 < policy.attempts {
                        tokio::time::sleep(policy.backoff.delay(attempt)).await;
                    }
                }
            }
        }
        Err(SourceError::Unavailable {
            source_id: self.source_id().to_string(),
            attempts: policy.attempts,
            reason: last_error,
        })
    }
}

pub type BoxedSource = Box<dyn SourceAdapter>;
