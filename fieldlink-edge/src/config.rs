//! Agent configuration model.
//!
//! The configuration is fetched as JSON from a remote management service.
//! The wire shape nests poll interval and payload format on the connection;
//! [`flatten`] copies those down onto each device and rewrites the tag list
//! into metric objects before anything else touches it.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use fieldlink_common::metric::{Metric, MetricProperties, parse_type};
use fieldlink_common::serialization::Format;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete agent configuration as delivered by the config service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Device connections to run, in order.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl AgentConfig {
    /// Parse and validate a fetched configuration document.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_json::from_value(value.clone())?;
        config.validate()?;
        Ok(config)
    }

    /// Whether a fetched document is a usable configuration.
    pub fn is_valid(value: &serde_json::Value) -> bool {
        Self::from_value(value).is_ok()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for conn in &self.connections {
            if conn.name.is_empty() {
                return Err(ConfigError::Validation(
                    "Connection name cannot be empty".to_string(),
                ));
            }
            if conn.protocol.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Connection '{}': protocol cannot be empty",
                    conn.name
                )));
            }
            if conn.poll_interval_ms == 0 {
                return Err(ConfigError::Validation(format!(
                    "Connection '{}': poll_interval_ms must be positive",
                    conn.name
                )));
            }

            let mut seen = std::collections::HashSet::new();
            for device in &conn.devices {
                if device.device_id.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Connection '{}': device id cannot be empty",
                        conn.name
                    )));
                }
                if !seen.insert(device.device_id.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "Connection '{}': duplicate device id '{}'",
                        conn.name, device.device_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One device connection: a driver instance plus the devices behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection name (used in status metrics).
    pub name: String,

    /// Protocol identifier resolved through the driver registry.
    pub protocol: String,

    /// Driver-specific connection parameters, opaque to the scheduler.
    #[serde(default)]
    pub params: serde_json::Value,

    /// Poll interval in milliseconds, copied down onto each device.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Payload serialization format for this connection's publishes.
    #[serde(default)]
    pub payload_format: Format,

    /// Exclusive connections poll strictly sequentially (shared bus).
    #[serde(default)]
    pub exclusive: bool,

    /// Devices behind this connection, in order.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// A device and its tag list as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier (used in topics).
    pub device_id: String,

    /// Per-device override of the connection poll interval.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    /// Tags to poll, in order.
    #[serde(default)]
    pub tags: Vec<TagSpec>,
}

/// One configured tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagSpec {
    /// Metric name (path segments separated by '/').
    pub name: String,

    /// Raw type tag, optionally carrying a `BE`/`LE` byte-order suffix.
    #[serde(rename = "type")]
    pub type_tag: String,

    /// Driver address specification. Opaque here; only the matching driver
    /// can interpret it.
    pub address: String,

    #[serde(default)]
    pub eng_unit: Option<String>,

    #[serde(default)]
    pub eng_low: Option<f64>,

    #[serde(default)]
    pub eng_high: Option<f64>,

    #[serde(default)]
    pub deadband: Option<f64>,

    #[serde(default)]
    pub tooltip: Option<String>,

    #[serde(default)]
    pub documentation: Option<String>,

    /// Whether downstream consumers should persist this tag.
    #[serde(default = "default_record")]
    pub record: bool,
}

fn default_record() -> bool {
    true
}

/// A device after flattening: interval and format resolved, tags rewritten
/// into metrics, the original tag list gone.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    pub device_id: String,
    pub poll_interval_ms: u64,
    pub payload_format: Format,
    pub metrics: Vec<Metric>,
}

/// Flatten a connection's nested shape onto its devices.
///
/// Tags with an unknown type tag are dropped with a warning; everything else
/// is carried over losslessly.
pub fn flatten(conn: &ConnectionConfig) -> Vec<DeviceSpec> {
    conn.devices
        .iter()
        .map(|device| DeviceSpec {
            device_id: device.device_id.clone(),
            poll_interval_ms: device.poll_interval_ms.unwrap_or(conn.poll_interval_ms),
            payload_format: conn.payload_format,
            metrics: device
                .tags
                .iter()
                .filter_map(|tag| match build_metric(tag) {
                    Some(metric) => Some(metric),
                    None => {
                        warn!(
                            device = %device.device_id,
                            tag = %tag.name,
                            type_tag = %tag.type_tag,
                            "Dropping tag with unknown type"
                        );
                        None
                    }
                })
                .collect(),
        })
        .collect()
}

/// Build a metric from a tag specification.
///
/// The byte-order suffix is split off the type tag and recorded as a
/// property so downstream consumers can unpack raw values correctly.
pub fn build_metric(tag: &TagSpec) -> Option<Metric> {
    let (datatype, endianness) = parse_type(&tag.type_tag)?;

    Some(
        Metric::new(&tag.name, datatype)
            .with_transient(!tag.record)
            .with_properties(MetricProperties {
                address: Some(tag.address.clone()),
                eng_unit: tag.eng_unit.clone(),
                eng_low: tag.eng_low,
                eng_high: tag.eng_high,
                deadband: tag.deadband,
                tooltip: tag.tooltip.clone(),
                documentation: tag.documentation.clone(),
                endianness,
            }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlink_common::metric::{ByteOrder, DataType};

    fn sample_config() -> serde_json::Value {
        serde_json::json!({
            "connections": [
                {
                    "name": "plant-bus",
                    "protocol": "modbus",
                    "params": { "host": "192.168.1.10" },
                    "poll_interval_ms": 1000,
                    "exclusive": true,
                    "devices": [
                        {
                            "device_id": "press-3",
                            "tags": [
                                {
                                    "name": "Hydraulics/Pressure",
                                    "type": "float,BE",
                                    "address": "1,holding,100,2",
                                    "eng_unit": "bar",
                                    "eng_low": 0.0,
                                    "eng_high": 400.0,
                                    "deadband": 0.5,
                                    "tooltip": "Main ram pressure",
                                }
                            ]
                        }
                    ]
                }
            ]
        })
    }

    #[test]
    fn test_parse_and_validate() {
        let config = AgentConfig::from_value(&sample_config()).unwrap();
        assert_eq!(config.connections.len(), 1);

        let conn = &config.connections[0];
        assert_eq!(conn.protocol, "modbus");
        assert!(conn.exclusive);
        assert_eq!(conn.devices[0].tags.len(), 1);
    }

    #[test]
    fn test_is_valid_rejects_garbage() {
        assert!(AgentConfig::is_valid(&sample_config()));
        assert!(!AgentConfig::is_valid(&serde_json::json!("not an object")));
        assert!(!AgentConfig::is_valid(&serde_json::json!({
            "connections": [{ "name": "", "protocol": "modbus" }]
        })));
        assert!(!AgentConfig::is_valid(&serde_json::json!({
            "connections": [{
                "name": "a", "protocol": "modbus", "poll_interval_ms": 0
            }]
        })));
    }

    #[test]
    fn test_validate_duplicate_device_ids() {
        let value = serde_json::json!({
            "connections": [{
                "name": "c1",
                "protocol": "waveform",
                "devices": [
                    { "device_id": "d1" },
                    { "device_id": "d1" },
                ]
            }]
        });
        assert!(AgentConfig::from_value(&value).is_err());
    }

    #[test]
    fn test_flatten_copies_interval_down() {
        let config = AgentConfig::from_value(&sample_config()).unwrap();
        let specs = flatten(&config.connections[0]);

        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].device_id, "press-3");
        assert_eq!(specs[0].poll_interval_ms, 1000);
    }

    #[test]
    fn test_flatten_is_lossless() {
        let config = AgentConfig::from_value(&sample_config()).unwrap();
        let specs = flatten(&config.connections[0]);
        let metric = &specs[0].metrics[0];

        // Type split into datatype plus recorded byte order
        assert_eq!(metric.name, "Hydraulics/Pressure");
        assert_eq!(metric.datatype, DataType::Float);
        assert_eq!(metric.properties.endianness, Some(ByteOrder::Big));

        // Remaining tag properties carried over untouched
        assert_eq!(metric.properties.address.as_deref(), Some("1,holding,100,2"));
        assert_eq!(metric.properties.eng_unit.as_deref(), Some("bar"));
        assert_eq!(metric.properties.eng_low, Some(0.0));
        assert_eq!(metric.properties.eng_high, Some(400.0));
        assert_eq!(metric.properties.deadband, Some(0.5));
        assert_eq!(metric.properties.tooltip.as_deref(), Some("Main ram pressure"));

        // Tags not marked for recording become transient; the default records
        assert!(!metric.is_transient);
    }

    #[test]
    fn test_flatten_device_override_wins() {
        let value = serde_json::json!({
            "connections": [{
                "name": "c1",
                "protocol": "waveform",
                "poll_interval_ms": 5000,
                "devices": [
                    { "device_id": "fast", "poll_interval_ms": 250 },
                    { "device_id": "slow" },
                ]
            }]
        });
        let config = AgentConfig::from_value(&value).unwrap();
        let specs = flatten(&config.connections[0]);

        assert_eq!(specs[0].poll_interval_ms, 250);
        assert_eq!(specs[1].poll_interval_ms, 5000);
    }

    #[test]
    fn test_flatten_drops_unknown_type() {
        let value = serde_json::json!({
            "connections": [{
                "name": "c1",
                "protocol": "waveform",
                "devices": [{
                    "device_id": "d1",
                    "tags": [
                        { "name": "Good", "type": "uint16", "address": "sine:10:5:f32" },
                        { "name": "Bad", "type": "quaternion", "address": "sine:10:5:f32" },
                    ]
                }]
            }]
        });
        let config = AgentConfig::from_value(&value).unwrap();
        let specs = flatten(&config.connections[0]);

        assert_eq!(specs[0].metrics.len(), 1);
        assert_eq!(specs[0].metrics[0].name, "Good");
    }

    #[test]
    fn test_transient_follows_record_flag() {
        let tag = TagSpec {
            name: "Status/Heartbeat".to_string(),
            type_tag: "boolean".to_string(),
            address: "constant:1:1:f32".to_string(),
            eng_unit: None,
            eng_low: None,
            eng_high: None,
            deadband: None,
            tooltip: None,
            documentation: None,
            record: false,
        };

        let metric = build_metric(&tag).unwrap();
        assert!(metric.is_transient);
    }
}
