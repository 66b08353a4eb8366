//! Health report: the status object operational tooling queries.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::detect::registry::DetectorStatsSnapshot;
use crate::ingest::SourceCounters;

/// Connection state of one source runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Connecting,
    Connected,
    Unavailable,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub state: SourceState,
    #[serde(flatten)]
    pub counters: SourceCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// detector_id → active.
    pub detectors: BTreeMap<String, bool>,
    pub sources: BTreeMap<String, SourceHealth>,
    pub queue_depth: usize,
    pub overflow_depth: usize,
    pub dead_letters: usize,
    pub uptime_secs: u64,
    pub detector_stats: Vec<DetectorStatsSnapshot>,
}

/// Inputs gathered from the running pipeline.
pub struct HealthInputs {
    pub detectors: BTreeMap<String, bool>,
    pub detector_stats: Vec<DetectorStatsSnapshot>,
    pub source_states: BTreeMap<String, SourceState>,
    pub source_counters: BTreeMap<String, SourceCounters>,
    pub queue_depth: usize,
    pub overflow_depth: usize,
    pub dead_letters: usize,
    pub uptime: Duration,
    pub ingestion_exhausted: bool,
}

impl HealthReport {
    /// Degraded when a detector is inactive, a source is unavailable or
    /// ingestion has run out of room.
    pub fn assemble(inputs: HealthInputs) -> Self {
        let mut sources = BTreeMap::new();
        for (id, state) in inputs.source_states {
            let counters = inputs.source_counters.get(&id).cloned().unwrap_or_default();
            sources.insert(id, SourceHealth { state, counters });
        }

        let degraded = inputs.ingestion_exhausted
            || inputs.detectors.values().any(|active| !active)
            || sources.values().any(|s| s.state == SourceState::Unavailable);

        Self {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            detectors: inputs.detectors,
            sources,
            queue_depth: inputs.queue_depth,
            overflow_depth: inputs.overflow_depth,
            dead_letters: inputs.dead_letters,
            uptime_secs: inputs.uptime.as_secs(),
            detector_stats: inputs.detector_stats,
        }
    }
}
