//! Modbus TCP driver.
//!
//! Address specifications take the form
//! `"<unitId>,<functionName>,<registerAddress>,<length>"`, e.g.
//! `"1,holding,100,2"`. Register reads come back as big-endian byte pairs;
//! coils and discrete inputs come back as one `0`/`1` byte each. Byte-order
//! interpretation is left entirely to the metric layer.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_modbus::client::{Context, Reader, tcp};
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

use crate::driver::{Address, ConnectionStatus, Driver};
use crate::drivers::DriverError;

/// Connection parameters for a Modbus TCP link.
#[derive(Debug, Clone, Deserialize)]
pub struct ModbusParams {
    /// Host address (IP or hostname).
    pub host: String,

    /// TCP port (default: 502).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connection timeout in milliseconds (default: 1000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_port() -> u16 {
    502
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Modbus register access functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFunction {
    /// Input registers (read-only, 16-bit).
    Input,
    /// Holding registers (read/write, 16-bit).
    Holding,
    /// Output coils (1-bit).
    Coil,
    /// Discrete input contacts (read-only, 1-bit).
    Discrete,
}

impl RegisterFunction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "input" => Some(RegisterFunction::Input),
            "holding" => Some(RegisterFunction::Holding),
            "coil" => Some(RegisterFunction::Coil),
            "discrete" => Some(RegisterFunction::Discrete),
            _ => None,
        }
    }
}

/// A validated Modbus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusAddress {
    pub unit: u8,
    pub function: RegisterFunction,
    pub address: u16,
    pub length: u16,
}

/// Driver for Modbus TCP devices.
pub struct ModbusDriver {
    params: ModbusParams,
    ctx: Option<Context>,
    status: ConnectionStatus,
}

impl ModbusDriver {
    pub fn new(params: ModbusParams) -> Self {
        Self {
            params,
            ctx: None,
            status: ConnectionStatus::Down,
        }
    }

    /// Registry factory.
    pub fn factory(params: &serde_json::Value) -> Result<Box<dyn Driver>, DriverError> {
        let params: ModbusParams =
            serde_json::from_value(params.clone()).map_err(|e| DriverError::Params(e.to_string()))?;
        Ok(Box::new(Self::new(params)))
    }

    /// Open the TCP connection, updating the status either way.
    async fn connect(&mut self) -> bool {
        let timeout = Duration::from_millis(self.params.timeout_ms);
        let target = format!("{}:{}", self.params.host, self.params.port);

        let resolved: Option<SocketAddr> = match tokio::net::lookup_host(&target).await {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                warn!(target = %target, error = %e, "Modbus host lookup failed");
                None
            }
        };

        let Some(socket_addr) = resolved else {
            self.status = ConnectionStatus::Conn;
            return false;
        };

        match tokio::time::timeout(timeout, tcp::connect(socket_addr)).await {
            Ok(Ok(ctx)) => {
                debug!(target = %target, "Modbus connected");
                self.ctx = Some(ctx);
                self.status = ConnectionStatus::Up;
                true
            }
            Ok(Err(e)) => {
                warn!(target = %target, error = %e, "Modbus connect failed");
                self.status = ConnectionStatus::Conn;
                false
            }
            Err(_) => {
                warn!(target = %target, "Modbus connect timed out");
                self.status = ConnectionStatus::Conn;
                false
            }
        }
    }
}

#[async_trait]
impl Driver for ModbusDriver {
    fn parse_addr(&self, spec: &str) -> Option<Address> {
        let parts: Vec<&str> = spec.split(',').collect();
        if parts.len() != 4 {
            return None;
        }

        let unit = parts[0].trim().parse::<u8>().ok()?;
        let function = RegisterFunction::parse(parts[1].trim())?;
        let address = parts[2].trim().parse::<u16>().ok()?;
        let length = parts[3].trim().parse::<u16>().ok()?;
        if length < 1 {
            return None;
        }

        Some(Address::Modbus(ModbusAddress {
            unit,
            function,
            address,
            length,
        }))
    }

    async fn run(&mut self) {
        self.connect().await;
    }

    async fn poll(&mut self, addr: &Address) -> Option<Vec<u8>> {
        let Address::Modbus(addr) = addr else {
            return None;
        };

        // Reopen lazily after a failure; the outer poll interval is the
        // retry cadence.
        if self.ctx.is_none() && !self.connect().await {
            return None;
        }
        let ctx = self.ctx.as_mut()?;
        ctx.set_slave(Slave(addr.unit));

        let result = match addr.function {
            RegisterFunction::Input => ctx
                .read_input_registers(addr.address, addr.length)
                .await
                .map(|r| r.map(registers_to_bytes)),
            RegisterFunction::Holding => ctx
                .read_holding_registers(addr.address, addr.length)
                .await
                .map(|r| r.map(registers_to_bytes)),
            RegisterFunction::Coil => ctx
                .read_coils(addr.address, addr.length)
                .await
                .map(|r| r.map(bits_to_bytes)),
            RegisterFunction::Discrete => ctx
                .read_discrete_inputs(addr.address, addr.length)
                .await
                .map(|r| r.map(bits_to_bytes)),
        };

        match result {
            Ok(Ok(bytes)) => {
                self.status = ConnectionStatus::Up;
                Some(bytes)
            }
            Ok(Err(exception)) => {
                // The device answered; the address itself is the problem.
                warn!(?addr, ?exception, "Modbus exception response");
                None
            }
            Err(e) => {
                warn!(?addr, error = %e, "Modbus read failed, dropping connection");
                self.ctx = None;
                self.status = ConnectionStatus::Conn;
                None
            }
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.status
    }
}

fn registers_to_bytes(registers: Vec<u16>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(registers.len() * 2);
    for register in registers {
        bytes.extend_from_slice(&register.to_be_bytes());
    }
    bytes
}

fn bits_to_bytes(bits: Vec<bool>) -> Vec<u8> {
    bits.into_iter().map(u8::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> ModbusDriver {
        ModbusDriver::new(ModbusParams {
            host: "127.0.0.1".to_string(),
            port: 502,
            timeout_ms: 100,
        })
    }

    #[test]
    fn test_parse_addr_valid() {
        let addr = driver().parse_addr("1,holding,100,2").unwrap();
        assert_eq!(
            addr,
            Address::Modbus(ModbusAddress {
                unit: 1,
                function: RegisterFunction::Holding,
                address: 100,
                length: 2,
            })
        );
    }

    #[test]
    fn test_parse_addr_all_functions() {
        for (name, function) in [
            ("input", RegisterFunction::Input),
            ("holding", RegisterFunction::Holding),
            ("coil", RegisterFunction::Coil),
            ("discrete", RegisterFunction::Discrete),
        ] {
            let spec = format!("2,{},0,1", name);
            match driver().parse_addr(&spec) {
                Some(Address::Modbus(addr)) => assert_eq!(addr.function, function),
                other => panic!("Expected Modbus address for '{}', got {:?}", spec, other),
            }
        }
    }

    #[test]
    fn test_parse_addr_wrong_arity() {
        assert_eq!(driver().parse_addr("1,holding,100"), None);
        assert_eq!(driver().parse_addr("1,holding,100,2,extra"), None);
        assert_eq!(driver().parse_addr(""), None);
    }

    #[test]
    fn test_parse_addr_bad_fields() {
        // Non-numeric numeric fields
        assert_eq!(driver().parse_addr("one,holding,100,2"), None);
        assert_eq!(driver().parse_addr("1,holding,abc,2"), None);
        // Unknown function name
        assert_eq!(driver().parse_addr("1,register,100,2"), None);
        // Zero length
        assert_eq!(driver().parse_addr("1,holding,100,0"), None);
        // Out-of-range unit id
        assert_eq!(driver().parse_addr("300,holding,100,2"), None);
    }

    #[test]
    fn test_parse_addr_idempotent() {
        let d = driver();
        assert_eq!(d.parse_addr("3,input,42,4"), d.parse_addr("3,input,42,4"));
    }

    #[test]
    fn test_registers_to_bytes_big_endian() {
        assert_eq!(
            registers_to_bytes(vec![0x42F6, 0xE979]),
            vec![0x42, 0xF6, 0xE9, 0x79]
        );
    }

    #[test]
    fn test_bits_to_bytes() {
        assert_eq!(bits_to_bytes(vec![true, false, true]), vec![1, 0, 1]);
    }
}
