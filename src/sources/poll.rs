//! Pull-based adapter: calls a [`Poller`] on a fixed interval.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::MissedTickBehavior;

use super::{MetricReading, MetricSample, SourceAdapter, SourceKind};
use crate::error::SourceError;

/// A feed that can be read on demand.
#[async_trait::async_trait]
pub trait Poller: Send {
    /// Check the feed is reachable.
    async fn open(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Read the current values.
    async fn poll(&mut self) -> Result<Vec<MetricReading>, SourceError>;

    async fn close(&mut self) {}
}

/// Drives a [`Poller`] every `interval`, flattening each poll into samples.
pub struct PollSource<P: Poller> {
    source_id: String,
    poller: P,
    interval: Duration,
}

impl<P: Poller> PollSource<P> {
    pub fn new(source_id: impl Into<String>, poller: P, interval: Duration) -> Self {
        Self {
            source_id: source_id.into(),
            poller,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl<P: Poller> SourceAdapter for PollSource<P> {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Poll
    }

    async fn open(&mut self) -> Result<(), SourceError> {
        self.poller.open().await
    }

    fn produce_samples(&mut self) -> BoxStream<'_, Result<MetricSample, SourceError>> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        stream::unfold(
            (self, ticker, VecDeque::new()),
            |(src, mut ticker, mut pending)| async move {
                loop {
                    if let Some(sample) = pending.pop_front() {
                        return Some((Ok(sample), (src, ticker, pending)));
                    }
                    ticker.tick().await;
                    match src.poller.poll().await {
                        Ok(readings) => {
                            let now = Utc::now();
                            pending.extend(
                                readings
                                    .into_iter()
                                    .map(|r| r.into_sample(&src.source_id, now)),
                            );
                        }
                        Err(e) => return Some((Err(e), (src, ticker, pending))),
                    }
                }
            },
        )
        .boxed()
    }

    async fn disconnect(&mut self) -> usize {
        self.poller.close().await;
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        polls: Vec<Result<Vec<MetricReading>, SourceError>>,
    }

    #[async_trait::async_trait]
    impl Poller for Scripted {
        async fn poll(&mut self) -> Result<Vec<MetricReading>, SourceError> {
            if self.polls.is_empty() {
                return Ok(Vec::new());
            }
            self.polls.remove(0)
        }
    }

    #[tokio::test]
    async fn test_poll_flattens_readings_in_order() {
        let poller = Scripted {
            polls: vec![
                Ok(vec![
                    MetricReading::new("cpu_usage", 40.0),
                    MetricReading::new("memory_usage", 60.0),
                ]),
                Ok(vec![MetricReading::new("cpu_usage", 41.0)]),
            ],
        };
        let mut src = PollSource::new("host", poller, Duration::from_millis(1));
        let samples: Vec<_> = src.produce_samples().take(3).collect().await;
        let samples: Vec<MetricSample> = samples.into_iter().map(Result::unwrap).collect();

        assert_eq!(samples[0].metric_name, "cpu_usage");
        assert_eq!(samples[1].metric_name, "memory_usage");
        assert_eq!(samples[0].timestamp, samples[1].timestamp);
        assert_eq!(samples[2].value, 41.0);
        assert!(samples.iter().all(|s| s.source_id == "host"));
    }

    #[tokio::test]
    async fn test_poll_error_surfaces_as_item() {
        let poller = Scripted {
            polls: vec![Err(SourceError::Io("gone".into()))],
        };
        let mut src = PollSource::new("host", poller, Duration::from_millis(1));
        let first = src.produce_samples().next().await.unwrap();
        assert!(matches!(first, Err(SourceError::Io(_))));
    }
}
