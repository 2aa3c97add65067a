//! Synthetic waveform driver for commissioning and tests.
//!
//! Address specifications take the form
//! `"<waveformName>:<periodSeconds>:<amplitude>:<packingCode>"`, e.g.
//! `"sine:10:5:f32"`. Each poll evaluates the waveform at the elapsed time
//! since the driver started and packs the sample big-endian at the width
//! the packing code selects.

use std::f64::consts::TAU;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;

use crate::driver::{Address, ConnectionStatus, Driver};
use crate::drivers::DriverError;

/// Connection parameters for the waveform driver. There is no device to
/// reach, so nothing is required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WaveformParams {}

/// Supported waveform shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformKind {
    Constant,
    Sine,
    Sawtooth,
}

impl WaveformKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "constant" | "const" => Some(WaveformKind::Constant),
            "sine" | "sin" => Some(WaveformKind::Sine),
            "sawtooth" | "saw" => Some(WaveformKind::Sawtooth),
            _ => None,
        }
    }
}

/// How a sample is packed into raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    F32,
    F64,
}

impl Packing {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "f32" => Some(Packing::F32),
            "f64" => Some(Packing::F64),
            _ => None,
        }
    }
}

/// A validated waveform address.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformAddress {
    pub kind: WaveformKind,
    pub period_secs: f64,
    pub amplitude: f64,
    pub packing: Packing,
}

/// Driver generating synthetic readings.
pub struct WaveformDriver {
    epoch: Option<Instant>,
    status: ConnectionStatus,
}

impl WaveformDriver {
    pub fn new(_params: WaveformParams) -> Self {
        Self {
            epoch: None,
            status: ConnectionStatus::Down,
        }
    }

    /// Registry factory.
    pub fn factory(params: &serde_json::Value) -> Result<Box<dyn Driver>, DriverError> {
        let params: WaveformParams = if params.is_null() {
            WaveformParams::default()
        } else {
            serde_json::from_value(params.clone())
                .map_err(|e| DriverError::Params(e.to_string()))?
        };
        Ok(Box::new(Self::new(params)))
    }

    fn sample(&self, addr: &WaveformAddress, t: f64) -> f64 {
        match addr.kind {
            WaveformKind::Constant => addr.amplitude,
            WaveformKind::Sine => addr.amplitude * (TAU * t / addr.period_secs).sin(),
            WaveformKind::Sawtooth => (addr.amplitude / addr.period_secs) * (t % addr.period_secs),
        }
    }
}

#[async_trait]
impl Driver for WaveformDriver {
    fn parse_addr(&self, spec: &str) -> Option<Address> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() != 4 {
            return None;
        }

        let kind = WaveformKind::parse(parts[0].trim())?;
        let period_secs = parts[1].trim().parse::<f64>().ok()?;
        if !period_secs.is_finite() || period_secs <= 0.0 {
            return None;
        }
        let amplitude = parts[2].trim().parse::<f64>().ok()?;
        if !amplitude.is_finite() {
            return None;
        }
        let packing = Packing::parse(parts[3].trim())?;

        Some(Address::Waveform(WaveformAddress {
            kind,
            period_secs,
            amplitude,
            packing,
        }))
    }

    async fn run(&mut self) {
        self.epoch = Some(Instant::now());
        self.status = ConnectionStatus::Up;
    }

    async fn poll(&mut self, addr: &Address) -> Option<Vec<u8>> {
        let Address::Waveform(addr) = addr else {
            return None;
        };

        let epoch = *self.epoch.get_or_insert_with(Instant::now);
        self.status = ConnectionStatus::Up;

        let value = self.sample(addr, epoch.elapsed().as_secs_f64());
        let bytes = match addr.packing {
            Packing::F32 => (value as f32).to_be_bytes().to_vec(),
            Packing::F64 => value.to_be_bytes().to_vec(),
        };
        Some(bytes)
    }

    fn status(&self) -> ConnectionStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> WaveformDriver {
        WaveformDriver::new(WaveformParams::default())
    }

    #[test]
    fn test_parse_addr_valid() {
        let addr = driver().parse_addr("sine:10:5:f32").unwrap();
        assert_eq!(
            addr,
            Address::Waveform(WaveformAddress {
                kind: WaveformKind::Sine,
                period_secs: 10.0,
                amplitude: 5.0,
                packing: Packing::F32,
            })
        );
    }

    #[test]
    fn test_parse_addr_wrong_arity() {
        assert_eq!(driver().parse_addr("sine:10:5"), None);
        assert_eq!(driver().parse_addr("sine:10:5:f32:extra"), None);
    }

    #[test]
    fn test_parse_addr_bad_fields() {
        // Unknown waveform name
        assert_eq!(driver().parse_addr("square:10:5:f32"), None);
        // Non-numeric period and amplitude
        assert_eq!(driver().parse_addr("sine:fast:5:f32"), None);
        assert_eq!(driver().parse_addr("sine:10:tall:f32"), None);
        // Non-positive period
        assert_eq!(driver().parse_addr("sine:0:5:f32"), None);
        assert_eq!(driver().parse_addr("sine:-3:5:f32"), None);
        // Unknown packing code
        assert_eq!(driver().parse_addr("sine:10:5:u128"), None);
    }

    #[test]
    fn test_parse_addr_idempotent() {
        let d = driver();
        assert_eq!(d.parse_addr("saw:2:8:f64"), d.parse_addr("saw:2:8:f64"));
    }

    #[test]
    fn test_sample_shapes() {
        let d = driver();
        let constant = WaveformAddress {
            kind: WaveformKind::Constant,
            period_secs: 1.0,
            amplitude: 7.5,
            packing: Packing::F64,
        };
        assert_eq!(d.sample(&constant, 0.0), 7.5);
        assert_eq!(d.sample(&constant, 123.0), 7.5);

        let sine = WaveformAddress {
            kind: WaveformKind::Sine,
            period_secs: 4.0,
            amplitude: 2.0,
            packing: Packing::F64,
        };
        assert!((d.sample(&sine, 1.0) - 2.0).abs() < 1e-9);
        assert!(d.sample(&sine, 0.0).abs() < 1e-9);

        let saw = WaveformAddress {
            kind: WaveformKind::Sawtooth,
            period_secs: 10.0,
            amplitude: 10.0,
            packing: Packing::F64,
        };
        assert!((d.sample(&saw, 3.0) - 3.0).abs() < 1e-9);
        assert!((d.sample(&saw, 13.0) - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_poll_packs_to_declared_width() {
        let mut d = driver();
        d.run().await;
        assert_eq!(d.status(), ConnectionStatus::Up);

        let f32_addr = d.parse_addr("constant:1:1.5:f32").unwrap();
        let bytes = d.poll(&f32_addr).await.unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(f32::from_be_bytes(bytes.try_into().unwrap()), 1.5);

        let f64_addr = d.parse_addr("constant:1:1.5:f64").unwrap();
        let bytes = d.poll(&f64_addr).await.unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(f64::from_be_bytes(bytes.try_into().unwrap()), 1.5);
    }
}
