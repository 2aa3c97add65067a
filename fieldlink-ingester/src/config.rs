//! Configuration for the ingester.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use fieldlink_common::config::{LoggingConfig, MqttConfig};
use fieldlink_common::sparkplug::DEFAULT_NAMESPACE;

use crate::batch::BatchConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] fieldlink_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete ingester configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngesterConfig {
    /// Broker connection settings.
    pub mqtt: MqttConfig,

    /// Topic namespace to subscribe to.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Debounce window for repeated births and rebirth requests, in
    /// milliseconds.
    #[serde(default = "default_birth_debounce_ms")]
    pub birth_debounce_ms: u64,

    /// Upper bound on tracked devices.
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,

    /// Batch sizing and flush cadence.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Downstream sink for decoded records.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_birth_debounce_ms() -> u64 {
    5000
}

fn default_max_devices() -> usize {
    4096
}

/// Sink selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Log decoded records (development).
    Log,
    /// Publish each record as JSON to a bus topic.
    Mqtt {
        /// Target topic, e.g. "uns/metrics".
        topic: String,
    },
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Log
    }
}

impl IngesterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: IngesterConfig = fieldlink_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() || self.namespace.contains(['/', '#', '+']) {
            return Err(ConfigError::Validation(format!(
                "Invalid namespace '{}'",
                self.namespace
            )));
        }
        if self.birth_debounce_ms == 0 {
            return Err(ConfigError::Validation(
                "birth_debounce_ms must be positive".to_string(),
            ));
        }
        if self.batch.max_records == 0 {
            return Err(ConfigError::Validation(
                "batch.max_records must be positive".to_string(),
            ));
        }
        if let SinkConfig::Mqtt { topic } = &self.sink
            && topic.is_empty()
        {
            return Err(ConfigError::Validation(
                "Sink topic cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlink_common::parse_config;

    #[test]
    fn test_parse_minimal_config() {
        let json5 = r#"
        {
            mqtt: { host: "broker.local" },
        }
        "#;

        let config: IngesterConfig = parse_config(json5).unwrap();
        config.validate().unwrap();

        assert_eq!(config.namespace, "flBv1");
        assert_eq!(config.birth_debounce_ms, 5000);
        assert_eq!(config.batch.max_records, 500);
        assert!(matches!(config.sink, SinkConfig::Log));
    }

    #[test]
    fn test_parse_mqtt_sink() {
        let json5 = r#"
        {
            mqtt: { host: "broker.local" },
            sink: { type: "mqtt", topic: "uns/metrics" },
            batch: { max_records: 100, flush_interval_ms: 500 },
        }
        "#;

        let config: IngesterConfig = parse_config(json5).unwrap();
        config.validate().unwrap();

        match &config.sink {
            SinkConfig::Mqtt { topic } => assert_eq!(topic, "uns/metrics"),
            other => panic!("Expected MQTT sink, got {:?}", other),
        }
        assert_eq!(config.batch.max_records, 100);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = r#"{ mqtt: { host: "h" }, "#;

        for bad in [
            r#"namespace: "a/b" }"#,
            r#"namespace: "" }"#,
            r#"birth_debounce_ms: 0 }"#,
            r#"batch: { max_records: 0 } }"#,
            r#"sink: { type: "mqtt", topic: "" } }"#,
        ] {
            let config: IngesterConfig = parse_config(&format!("{}{}", base, bad)).unwrap();
            assert!(config.validate().is_err(), "expected rejection of {}", bad);
        }
    }
}
