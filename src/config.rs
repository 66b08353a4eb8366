//! TOML configuration for anomalyd.
//!
//! Layered model: compiled-in defaults, an optional config file located via
//! `ANOMALYD_CONFIG` or the standard system path, then a handful of
//! environment overrides. [`AppConfig::validate`] rejects anything the
//! pipeline cannot start with.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::factory::DetectorFactory;
use crate::detect::SeverityThresholds;
use crate::error::ConfigError;
use crate::sources::factory::SourceFactory;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the anomalyd process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detectors: Vec<DetectorConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path` and apply env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.apply_env_overrides();
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `ANOMALYD_CONFIG` environment variable.
    /// 2. `/etc/anomalyd/anomalyd.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("ANOMALYD_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ANOMALYD_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/anomalyd/anomalyd.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `ANOMALYD_*` environment overrides. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
            let raw = std::env::var(name).ok()?;
            match raw.parse() {
                Ok(v) => {
                    info!(var = name, value = %raw, "applied environment override");
                    Some(v)
                }
                Err(_) => {
                    warn!(var = name, value = %raw, "ignoring unparseable environment override");
                    None
                }
            }
        }

        if let Some(v) = parse_env("ANOMALYD_QUEUE_CAPACITY") {
            self.pipeline.queue_capacity = v;
        }
        if let Some(v) = parse_env("ANOMALYD_WORKER_COUNT") {
            self.pipeline.worker_count = v;
        }
        if let Some(v) = parse_env("ANOMALYD_BATCH_SIZE") {
            self.pipeline.batch_size = v;
        }
        if let Some(v) = parse_env::<String>("ANOMALYD_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Check every section against the built-in detector and source kinds;
    /// the first problem found is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_with(&DetectorFactory::builtin(), &SourceFactory::builtin())
    }

    /// Like [`AppConfig::validate`], resolving kinds through the given
    /// factories so registered extensions are accepted.
    pub fn validate_with(
        &self,
        detectors: &DetectorFactory,
        sources: &SourceFactory,
    ) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        self.window.validate()?;
        self.storage.validate()?;

        let mut ids = HashSet::new();
        for detector in &self.detectors {
            if !ids.insert(detector.id.as_str()) {
                return Err(ConfigError::new(
                    format!("detector '{}'", detector.id),
                    "duplicate detector id",
                ));
            }
            detector.validate(&self.window)?;
            // Building runs the detector's own option checks.
            detectors.build(detector)?;
        }

        let mut ids = HashSet::new();
        for source in &self.sources {
            if !ids.insert(source.id.as_str()) {
                return Err(ConfigError::new(
                    format!("source '{}'", source.id),
                    "duplicate source id",
                ));
            }
            source.validate()?;
            if !sources.knows(&source.kind) {
                return Err(ConfigError::new(
                    format!("source '{}'", source.id),
                    format!("unknown source type '{}'", source.kind),
                ));
            }
        }

        self.memory.validate()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Pipeline-wide admission, worker and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the in-memory admission queue, in samples.
    pub queue_capacity: usize,
    /// Number of detection workers; sources are sharded across them.
    pub worker_count: usize,
    /// Anomaly Events per delivery batch.
    pub batch_size: usize,
    /// Maximum time a partial batch waits before delivery.
    pub flush_interval_ms: u64,
    /// Total delivery attempts per batch before dead-lettering.
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Per-attempt delivery timeout.
    pub delivery_timeout_ms: u64,
    /// How often the recovery sweep looks at the overflow store.
    pub sweep_interval_ms: u64,
    /// Time adapters get to acknowledge disconnect during shutdown.
    pub shutdown_grace_ms: u64,
    /// Drops caused by a failing overflow store (not quota) before the
    /// pipeline gives up.
    pub max_consecutive_store_failures: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            worker_count: 4,
            batch_size: 100,
            flush_interval_ms: 5000,
            max_retry_attempts: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5000,
            delivery_timeout_ms: 2000,
            sweep_interval_ms: 500,
            shutdown_grace_ms: 5000,
            max_consecutive_store_failures: 1000,
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("queue_capacity", self.queue_capacity as u64),
            ("worker_count", self.worker_count as u64),
            ("batch_size", self.batch_size as u64),
            ("flush_interval_ms", self.flush_interval_ms),
            ("max_retry_attempts", self.max_retry_attempts as u64),
            ("delivery_timeout_ms", self.delivery_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::new("pipeline", format!("{name} must be > 0")));
            }
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::new(
                "pipeline",
                "retry_max_delay_ms must be >= retry_base_delay_ms",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// Window Store settings, shared by every (source, metric) key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub window_size: usize,
    /// Snapshots below this length are flagged insufficient.
    pub min_samples: usize,
    /// EMA smoothing factor α in (0, 1].
    pub ema_alpha: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            min_samples: 10,
            ema_alpha: 0.1,
        }
    }
}

impl WindowConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size < 2 {
            return Err(ConfigError::new("window", "window_size must be >= 2"));
        }
        if self.min_samples == 0 || self.min_samples > self.window_size {
            return Err(ConfigError::new(
                "window",
                "min_samples must be in 1..=window_size",
            ));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(ConfigError::new("window", "ema_alpha must be in (0, 1]"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Local SQLite stores: overflow, dead-letter and outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Overflow records kept before spillover reports quota exhaustion.
    pub overflow_max_records: usize,
    /// Samples per overflow record before it is sealed.
    pub spill_batch_size: usize,
    /// Overflow records older than this are purged and counted as drops.
    pub overflow_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/anomalyd.db"),
            overflow_max_records: 10_000,
            spill_batch_size: 1,
            overflow_ttl_secs: 86_400,
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.spill_batch_size == 0 {
            return Err(ConfigError::new("storage", "spill_batch_size must be > 0"));
        }
        if self.overflow_ttl_secs == 0 {
            return Err(ConfigError::new("storage", "overflow_ttl_secs must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Detectors
// ---------------------------------------------------------------------------

/// One `[[detectors]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub options: DetectorOptions,
}

impl DetectorConfig {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            enabled: true,
            options: DetectorOptions::default(),
        }
    }

    fn validate(&self, window: &WindowConfig) -> Result<(), ConfigError> {
        let component = format!("detector '{}'", self.id);
        if self.id.is_empty() {
            return Err(ConfigError::new("detector", "id must not be empty"));
        }
        if let Some(size) = self.options.window_size {
            if size != window.window_size {
                return Err(ConfigError::new(
                    component,
                    format!(
                        "window_size {size} disagrees with [window] window_size {}",
                        window.window_size
                    ),
                ));
            }
        }
        if let Some(alpha) = self.options.ema_alpha {
            if (alpha - window.ema_alpha).abs() > f64::EPSILON {
                return Err(ConfigError::new(
                    component,
                    format!("ema_alpha {alpha} disagrees with [window] ema_alpha {}", window.ema_alpha),
                ));
            }
        }
        if let Some(min) = self.options.min_samples {
            if min > window.window_size {
                return Err(ConfigError::new(component, "min_samples exceeds window_size"));
            }
        }
        Ok(())
    }
}

/// Options understood by the built-in detectors.
///
/// Every field is optional so one table shape serves all detector types;
/// each detector's `configure` picks what it needs and fills defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorOptions {
    /// Metrics this detector subscribes to. Empty means every metric.
    pub metrics: Vec<String>,
    /// Must match `[window] window_size` when present.
    pub window_size: Option<usize>,
    /// Must match `[window] ema_alpha` when present.
    pub ema_alpha: Option<f64>,
    /// Detector-specific cold-start guard, at least the store's.
    pub min_samples: Option<usize>,
    pub std_dev_threshold: Option<f64>,
    pub use_iqr: Option<bool>,
    pub iqr_multiplier: Option<f64>,
    pub use_mad: Option<bool>,
    pub mad_threshold: Option<f64>,
    pub severity_thresholds: Option<SeverityThresholds>,
    pub confidence_scale: Option<f64>,
    /// Merge metrics of one source crossing thresholds in the same pass.
    pub correlate: Option<bool>,
    /// `ema` detector: deviation from the previous EMA, in std-devs.
    pub deviation_threshold: Option<f64>,
    /// `threshold` detector bounds.
    pub min: Option<f64>,
    pub max: Option<f64>,
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// One `[[sources]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Endpoint for `http_json` sources.
    #[serde(default)]
    pub url: Option<String>,
    /// Buffer size for `push` sources.
    #[serde(default = "default_push_buffer")]
    pub push_buffer: usize,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_base_delay_ms")]
    pub connect_base_delay_ms: u64,
    #[serde(default = "default_connect_max_delay_ms")]
    pub connect_max_delay_ms: u64,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            enabled: true,
            poll_interval_ms: default_poll_interval_ms(),
            url: None,
            push_buffer: default_push_buffer(),
            connect_attempts: default_connect_attempts(),
            connect_base_delay_ms: default_connect_base_delay_ms(),
            connect_max_delay_ms: default_connect_max_delay_ms(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let component = format!("source '{}'", self.id);
        if self.id.is_empty() {
            return Err(ConfigError::new("source", "id must not be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::new(component, "poll_interval_ms must be > 0"));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::new(component, "connect_attempts must be > 0"));
        }
        if self.kind == "http_json" && self.url.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::new(component, "http_json sources require a url"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_push_buffer() -> usize {
    256
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_base_delay_ms() -> u64 {
    250
}

fn default_connect_max_delay_ms() -> u64 {
    10_000
}

// ---------------------------------------------------------------------------
// Memory system
// ---------------------------------------------------------------------------

/// How anomaly batches reach the downstream memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Log batches only; used when no downstream is wired.
    Log,
    /// In-process call into a handler registered by the embedding program.
    Direct,
    /// Publish on a named channel of the in-process message bus.
    Channel,
    /// POST the batch as JSON.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub mode: MemoryMode,
    pub channel: String,
    pub url: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mode: MemoryMode::Log,
            channel: "anomaly_events".to_string(),
            url: None,
        }
    }
}

impl MemoryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            MemoryMode::Channel if self.channel.is_empty() => {
                Err(ConfigError::new("memory", "channel mode requires a channel name"))
            }
            MemoryMode::Http if self.url.as_deref().map_or(true, str::is_empty) => {
                Err(ConfigError::new("memory", "http mode requires a url"))
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// API & logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9464".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `anomalyd=debug`.
    pub level: String,
    /// `"text"` or `"json"`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
