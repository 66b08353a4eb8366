//! Startup-time mapping from source type names to constructors.

use std::collections::BTreeMap;
use std::time::Duration;

use super::http::HttpJsonPoller;
use super::poll::PollSource;
use super::push::PushSource;
use super::system::SystemPoller;
use super::{BoxedSource, ConnectPolicy};
use crate::config::SourceConfig;
use crate::error::ConfigError;

pub type SourceConstructor = fn(&SourceConfig) -> Result<BoxedSource, ConfigError>;

/// Table of known source types, built once at process start.
pub struct SourceFactory {
    constructors: BTreeMap<&'static str, SourceConstructor>,
}

impl SourceFactory {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// The built-in `system`, `http_json` and `push` types.
    pub fn builtin() -> Self {
        let mut factory = Self::empty();
        factory.register("system", build_system);
        factory.register("http_json", build_http_json);
        factory.register("push", build_push);
        factory
    }

    pub fn register(&mut self, kind: &'static str, constructor: SourceConstructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }

    pub fn build(&self, config: &SourceConfig) -> Result<BoxedSource, ConfigError> {
        let constructor = self.constructors.get(config.kind.as_str()).ok_or_else(|| {
            ConfigError::new(
                format!("source '{}'", config.id),
                format!("unknown source type '{}'", config.kind),
            )
        })?;
        constructor(config)
    }
}

/// Reconnect policy from a source's config entry.
pub fn connect_policy(config: &SourceConfig) -> ConnectPolicy {
    ConnectPolicy::new(
        config.connect_attempts,
        Duration::from_millis(config.connect_base_delay_ms),
        Duration::from_millis(config.connect_max_delay_ms),
    )
}

fn build_system(config: &SourceConfig) -> Result<BoxedSource, ConfigError> {
    Ok(Box::new(PollSource::new(
        config.id.clone(),
        SystemPoller::default(),
        config.poll_interval(),
    )))
}

fn build_http_json(config: &SourceConfig) -> Result<BoxedSource, ConfigError> {
    let component = format!("source '{}'", config.id);
    let url = config
        .url
        .clone()
        .ok_or_else(|| ConfigError::new(component.as_str(), "http_json sources require a url"))?;
    // A poll must finish before the next one is due.
    let timeout = config.poll_interval().max(Duration::from_millis(100));
    let poller = HttpJsonPoller::new(url, timeout)
        .map_err(|e| ConfigError::new(component.as_str(), e.to_string()))?;
    Ok(Box::new(PollSource::new(
        config.id.clone(),
        poller,
        config.poll_interval(),
    )))
}

fn build_push(config: &SourceConfig) -> Result<BoxedSource, ConfigError> {
    Ok(Box::new(PushSource::new(config.id.clone(), config.push_buffer)))
}
