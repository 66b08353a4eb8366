//! Error taxonomy for the detection pipeline.
//!
//! Each stage has its own error type; [`PipelineError`] is the top-level
//! classification operators see in logs and health output.

use thiserror::Error;

/// Failures raised by a Source Adapter.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source '{source_id}' unavailable after {attempts} attempt(s): {reason}")]
    Unavailable {
        source_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("source I/O error: {0}")]
    Io(String),

    #[error("failed to decode source payload: {0}")]
    Decode(String),
}

/// Failures writing to or reading from the overflow store.
#[derive(Debug, Error)]
pub enum SpilloverError {
    #[error("overflow quota exceeded ({records} records, limit {limit})")]
    QuotaExceeded { records: usize, limit: usize },

    #[error("overflow storage unavailable: {0}")]
    Storage(String),

    #[error("failed to encode overflow record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures delivering a batch to the downstream memory system.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("downstream rejected batch: {0}")]
    Rejected(String),

    #[error("delivery timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no subscribers on channel '{0}'")]
    NoSubscribers(String),
}

/// Invalid detector, source or pipeline options.
#[derive(Debug, Error)]
#[error("invalid configuration for {component}: {reason}")]
pub struct ConfigError {
    pub component: String,
    pub reason: String,
}

impl ConfigError {
    pub fn new(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level pipeline error classification.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    SourceUnavailable(#[from] SourceError),

    #[error("admission queue full")]
    AdmissionOverflow,

    #[error(transparent)]
    SpilloverFailure(#[from] SpilloverError),

    #[error("insufficient history: need {needed} samples, have {have}")]
    InsufficientHistory { needed: usize, have: usize },

    #[error(transparent)]
    DeliveryFailure(#[from] DeliveryError),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("ingestion resources exhausted: queue full and overflow store failing ({consecutive} consecutive drops)")]
    ResourceExhausted { consecutive: u64 },

    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    /// Whether this error stops the whole pipeline rather than one component.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_) | PipelineError::ResourceExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_and_exhaustion_are_fatal() {
        assert!(PipelineError::from(ConfigError::new("detector", "bad")).is_fatal());
        assert!(PipelineError::ResourceExhausted { consecutive: 5 }.is_fatal());
        assert!(!PipelineError::AdmissionOverflow.is_fatal());
        assert!(!PipelineError::from(DeliveryError::Rejected("x".into())).is_fatal());
        assert!(!PipelineError::InsufficientHistory { needed: 10, have: 3 }.is_fatal());
    }

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::new("detector 'cpu'", "std_dev_threshold must be > 0");
        assert_eq!(
            err.to_string(),
            "invalid configuration for detector 'cpu': std_dev_threshold must be > 0"
        );
    }
}
