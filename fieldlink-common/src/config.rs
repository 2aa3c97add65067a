use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Common MQTT connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host (IP or hostname).
    pub host: String,

    /// Broker port (default: 1883).
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Username, if the broker requires authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Password, if the broker requires authentication.
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in seconds (default: 30).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

impl MqttConfig {
    /// Parse a broker URL of the form `mqtt://host[:port]` (plain `host[:port]`
    /// is also accepted).
    pub fn from_url(url: &str) -> Result<Self> {
        let stripped = url
            .strip_prefix("mqtt://")
            .or_else(|| url.strip_prefix("tcp://"))
            .unwrap_or(url);

        if stripped.is_empty() {
            return Err(Error::Config(format!("Invalid MQTT URL '{}'", url)));
        }

        let (host, port) = match stripped.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("Invalid MQTT port in '{}'", url)))?;
                (host.to_string(), port)
            }
            None => (stripped.to_string(), default_mqtt_port()),
        };

        if host.is_empty() {
            return Err(Error::Config(format!("Invalid MQTT URL '{}'", url)));
        }

        Ok(Self {
            host,
            port,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
        })
    }

    /// Attach credentials to this configuration.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}
