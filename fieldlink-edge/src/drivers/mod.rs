//! Concrete drivers and the protocol registry.

pub mod modbus;
pub mod waveform;

use std::collections::HashMap;

use thiserror::Error;

use crate::driver::Driver;

/// Errors raised when constructing a driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("Invalid driver parameters: {0}")]
    Params(String),
}

/// Constructor for a driver, fed the connection's parameter document.
pub type DriverFactory = fn(&serde_json::Value) -> Result<Box<dyn Driver>, DriverError>;

/// Maps a protocol identifier to a driver constructor.
///
/// New protocols register here without touching the scheduler.
pub struct DriverRegistry {
    factories: HashMap<&'static str, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory for a protocol identifier.
    pub fn register(&mut self, protocol: &'static str, factory: DriverFactory) {
        self.factories.insert(protocol, factory);
    }

    /// Instantiate a driver for a protocol.
    pub fn create(
        &self,
        protocol: &str,
        params: &serde_json::Value,
    ) -> Result<Box<dyn Driver>, DriverError> {
        let factory = self
            .factories
            .get(protocol)
            .ok_or_else(|| DriverError::UnknownProtocol(protocol.to_string()))?;
        factory(params)
    }

    /// Registered protocol identifiers.
    pub fn protocols(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("modbus", modbus::ModbusDriver::factory);
        registry.register("waveform", waveform::WaveformDriver::factory);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_protocols() {
        let registry = DriverRegistry::default();
        let mut protocols: Vec<_> = registry.protocols().collect();
        protocols.sort();
        assert_eq!(protocols, vec!["modbus", "waveform"]);
    }

    #[test]
    fn test_unknown_protocol() {
        let registry = DriverRegistry::default();
        let result = registry.create("opcua", &serde_json::Value::Null);
        assert!(matches!(result, Err(DriverError::UnknownProtocol(_))));
    }

    #[test]
    fn test_create_waveform() {
        let registry = DriverRegistry::default();
        let driver = registry.create("waveform", &serde_json::Value::Null).unwrap();
        assert_eq!(driver.status(), crate::driver::ConnectionStatus::Down);
    }

    #[test]
    fn test_create_modbus_requires_host() {
        let registry = DriverRegistry::default();
        let result = registry.create("modbus", &serde_json::json!({}));
        assert!(matches!(result, Err(DriverError::Params(_))));

        let result = registry.create("modbus", &serde_json::json!({ "host": "10.0.0.5" }));
        assert!(result.is_ok());
    }
}
