//! Fieldlink Common Library
//!
//! This crate provides shared types and utilities for the Fieldlink edge
//! translator and ingester:
//!
//! - [`metric`] - Metric data model (datatypes, values, byte-order handling)
//! - [`sparkplug`] - Bus topic convention and birth/data/death payloads
//! - [`serialization`] - JSON/CBOR payload encoding and decoding
//! - [`transport`] - MQTT session management (connect, last will, events)
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`boundedset`] - Insertion-ordered bounded key set
//! - [`error`] - Error types

pub mod boundedset;
pub mod config;
pub mod error;
pub mod metric;
pub mod serialization;
pub mod sparkplug;
pub mod transport;

// Re-export commonly used types at the crate root
pub use boundedset::BoundedKeySet;
pub use config::{LogFormat, LoggingConfig, MqttConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use metric::{ByteOrder, DataType, Metric, MetricValue, current_timestamp_millis};
pub use serialization::{Format, decode, decode_auto, encode};
pub use sparkplug::{DEFAULT_NAMESPACE, MessageKind, Payload, PayloadMetric, Topic};
pub use transport::{Transport, TransportEvent};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// # Example
///
/// ```ignore
/// use fieldlink_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
