//! The downstream memory system's ingestion capability and its adapters.
//!
//! The sink only ever calls [`MemoryInterface::ingest`]; which adapter is
//! bound is decided once, from `[memory] mode`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::bus::MessageBus;
use crate::config::{MemoryConfig, MemoryMode};
use crate::detect::AnomalyEvent;
use crate::error::{ConfigError, DeliveryError};

#[async_trait]
pub trait MemoryInterface: Send + Sync {
    /// Adapter name for logs.
    fn name(&self) -> &str;

    /// Hand one batch to the memory system. `Ok` is the acknowledgement.
    async fn ingest(&self, batch: &[AnomalyEvent]) -> Result<(), DeliveryError>;
}

pub type SharedMemory = Arc<dyn MemoryInterface>;

/// In-process handler registered by the embedding program.
pub type IngestHandler = Arc<dyn Fn(&[AnomalyEvent]) -> Result<(), DeliveryError> + Send + Sync>;

/// Direct function-call adapter.
pub struct DirectMemory {
    handler: IngestHandler,
}

impl DirectMemory {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&[AnomalyEvent]) -> Result<(), DeliveryError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl MemoryInterface for DirectMemory {
    fn name(&self) -> &str {
        "direct"
    }

    async fn ingest(&self, batch: &[AnomalyEvent]) -> Result<(), DeliveryError> {
        (self.handler)(batch)
    }
}

/// Publishes each batch on a named bus channel. A publish nobody receives
/// is a failure, so the sink retries it like any other.
pub struct ChannelPublisher {
    bus: MessageBus,
    channel: String,
}

impl ChannelPublisher {
    pub fn new(bus: MessageBus, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl MemoryInterface for ChannelPublisher {
    fn name(&self) -> &str {
        "channel"
    }

    async fn ingest(&self, batch: &[AnomalyEvent]) -> Result<(), DeliveryError> {
        let reached = self.bus.publish(&self.channel, Arc::new(batch.to_vec()));
        if reached == 0 {
            return Err(DeliveryError::NoSubscribers(self.channel.clone()));
        }
        debug!(channel = %self.channel, receivers = reached, events = batch.len(), "published batch");
        Ok(())
    }
}

/// POSTs the batch as a JSON array of ingest records.
pub struct HttpMemory {
    client: reqwest::Client,
    url: String,
}

impl HttpMemory {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::new("memory", format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MemoryInterface for HttpMemory {
    fn name(&self) -> &str {
        "http"
    }

    async fn ingest(&self, batch: &[AnomalyEvent]) -> Result<(), DeliveryError> {
        let body: Vec<Value> = batch.iter().map(AnomalyEvent::to_ingest_record).collect();
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected(format!("HTTP {status}")));
        }
        Ok(())
    }
}

/// Logs every batch and acknowledges it. Bound when no downstream is wired.
pub struct LoggingMemory;

#[async_trait]
impl MemoryInterface for LoggingMemory {
    fn name(&self) -> &str {
        "log"
    }

    async fn ingest(&self, batch: &[AnomalyEvent]) -> Result<(), DeliveryError> {
        for event in batch {
            info!(
                detector = %event.detector_id,
                source = %event.source_id,
                severity = %event.severity,
                confidence = event.confidence,
                metrics = ?event.affected_metrics,
                "anomaly"
            );
        }
        Ok(())
    }
}

/// Bind the adapter named by `[memory] mode`.
///
/// `direct` needs a handler and `channel` needs a bus with subscribers,
/// both from the embedding program, so neither can be built from
/// configuration alone.
pub fn from_config(
    config: &MemoryConfig,
    bus: Option<&MessageBus>,
    timeout: Duration,
) -> Result<SharedMemory, ConfigError> {
    match config.mode {
        MemoryMode::Log => Ok(Arc::new(LoggingMemory)),
        MemoryMode::Channel => {
            let bus = bus.ok_or_else(|| {
                ConfigError::new(
                    "memory",
                    "channel mode requires an in-process message bus; bind one with PipelineBuilder::bus",
                )
            })?;
            Ok(Arc::new(ChannelPublisher::new(bus.clone(), &config.channel)))
        }
        MemoryMode::Http => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| ConfigError::new("memory", "http mode requires a url"))?;
            Ok(Arc::new(HttpMemory::new(url, timeout)?))
        }
        MemoryMode::Direct => Err(ConfigError::new(
            "memory",
            "direct mode requires an in-process handler; bind one with PipelineBuilder::memory",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn events() -> Vec<AnomalyEvent> {
        vec![AnomalyEvent::new("stat", "host", Utc::now(), "statistical_outlier")]
    }

    #[tokio::test]
    async fn test_direct_calls_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let memory = DirectMemory::new(move |batch| {
            seen.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        });
        memory.ingest(&events()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_requires_subscriber() {
        let bus = MessageBus::default();
        let memory = ChannelPublisher::new(bus.clone(), "anomalies");
        assert!(matches!(
            memory.ingest(&events()).await,
            Err(DeliveryError::NoSubscribers(_))
        ));

        let mut rx = bus.subscribe("anomalies");
        memory.ingest(&events()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap()[0].detector_id, "stat");
    }

    #[test]
    fn test_from_config_modes() {
        let bus = MessageBus::default();
        let timeout = Duration::from_secs(1);
        let log = from_config(&MemoryConfig::default(), None, timeout).unwrap();
        assert_eq!(log.name(), "log");

        let direct = MemoryConfig {
            mode: MemoryMode::Direct,
            ..Default::default()
        };
        assert!(from_config(&direct, Some(&bus), timeout).is_err());
    }

    #[test]
    fn test_channel_mode_needs_a_bus() {
        let timeout = Duration::from_secs(1);
        let channel = MemoryConfig {
            mode: MemoryMode::Channel,
            ..Default::default()
        };
        let err = from_config(&channel, None, timeout).err().unwrap();
        assert!(err.reason.contains("message bus"));

        let bus = MessageBus::default();
        let memory = from_config(&channel, Some(&bus), timeout).unwrap();
        assert_eq!(memory.name(), "channel");
    }
}
