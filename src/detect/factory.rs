//! Startup-time mapping from detector type names to constructors.

use std::collections::BTreeMap;

use super::ema::EmaDetector;
use super::statistical::StatisticalDetector;
use super::threshold::ThresholdDetector;
use super::Detector;
use crate::config::DetectorConfig;
use crate::error::ConfigError;

pub type DetectorConstructor = fn(&str) -> Box<dyn Detector>;

pub struct DetectorFactory {
    constructors: BTreeMap<&'static str, DetectorConstructor>,
}

impl DetectorFactory {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// The built-in `statistical`, `ema` and `threshold` types.
    pub fn builtin() -> Self {
        let mut factory = Self::empty();
        factory.register("statistical", |id: &str| -> Box<dyn Detector> {
            Box::new(StatisticalDetector::new(id))
        });
        factory.register("ema", |id: &str| -> Box<dyn Detector> {
            Box::new(EmaDetector::new(id))
        });
        factory.register("threshold", |id: &str| -> Box<dyn Detector> {
            Box::new(ThresholdDetector::new(id))
        });
        factory
    }

    pub fn register(&mut self, kind: &'static str, constructor: DetectorConstructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }

    /// Construct and configure one detector.
    pub fn build(&self, config: &DetectorConfig) -> Result<Box<dyn Detector>, ConfigError> {
        let constructor = self.constructors.get(config.kind.as_str()).ok_or_else(|| {
            ConfigError::new(
                format!("detector '{}'", config.id),
                format!("unknown detector type '{}'", config.kind),
            )
        })?;
        let mut detector = constructor(&config.id);
        detector.configure(&config.options)?;
        Ok(detector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let factory = DetectorFactory::builtin();
        assert_eq!(factory.kinds(), vec!["ema", "statistical", "threshold"]);
        assert!(factory.knows("statistical"));
        assert!(!factory.knows("isolation_forest"));
    }

    #[test]
    fn test_build_configures() {
        let factory = DetectorFactory::builtin();
        let mut config = DetectorConfig::new("cpu-stat", "statistical");
        config.options.metrics = vec!["cpu_usage".into()];
        let d = factory.build(&config).unwrap();
        assert_eq!(d.detector_id(), "cpu-stat");
        assert_eq!(d.subscriptions(), ["cpu_usage".to_string()]);

        config.options.std_dev_threshold = Some(-2.0);
        assert!(factory.build(&config).is_err());
    }

    #[test]
    fn test_unknown_kind() {
        let factory = DetectorFactory::builtin();
        let err = factory
            .build(&DetectorConfig::new("x", "prophet"))
            .err()
            .unwrap();
        assert!(err.reason.contains("prophet"));
    }
}
