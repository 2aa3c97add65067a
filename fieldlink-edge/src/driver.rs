//! The driver capability set.

use async_trait::async_trait;
use std::fmt;

use crate::drivers::modbus::ModbusAddress;
use crate::drivers::waveform::WaveformAddress;

/// Connection status as owned by a driver.
///
/// Surfaced to the translator for publication as a status metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Connected and reading.
    Up,
    /// Connecting or retrying.
    Conn,
    /// Not connected.
    Down,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Up => "UP",
            ConnectionStatus::Conn => "CONN",
            ConnectionStatus::Down => "DOWN",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed, validated device address.
///
/// Produced only by the matching driver's [`Driver::parse_addr`]; opaque to
/// the scheduler. Either fully valid or absent, never partially filled.
#[derive(Debug, Clone, PartialEq)]
pub enum Address {
    Modbus(ModbusAddress),
    Waveform(WaveformAddress),
}

/// A protocol-specific unit able to parse addresses and perform a single
/// poll against a device.
#[async_trait]
pub trait Driver: Send {
    /// Validate an address specification.
    ///
    /// Pure and side-effect free so it can run at config-load time, ahead
    /// of any device I/O. Returns `None` on any malformed field.
    fn parse_addr(&self, spec: &str) -> Option<Address>;

    /// Establish baseline state (open a connection) and set the initial
    /// status.
    async fn run(&mut self);

    /// Perform one read.
    ///
    /// Returns raw bytes sized to the address's declared width, or `None`
    /// on failure. Failures reopen the underlying connection lazily on a
    /// later call; retries happen at the outer poll interval, not here.
    async fn poll(&mut self, addr: &Address) -> Option<Vec<u8>>;

    /// Current connection status.
    fn status(&self) -> ConnectionStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(ConnectionStatus::Up.as_str(), "UP");
        assert_eq!(ConnectionStatus::Conn.as_str(), "CONN");
        assert_eq!(ConnectionStatus::Down.as_str(), "DOWN");
    }
}
