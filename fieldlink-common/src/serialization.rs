use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Serialization format for wire payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON format (human-readable, good for debugging).
    #[default]
    Json,

    /// CBOR format (compact binary, better for high-volume traffic).
    Cbor,
}

impl Format {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Cbor => "application/cbor",
        }
    }
}

/// Encode a value to bytes using the specified format.
pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => serde_json::to_vec(value).map_err(Error::from),
        Format::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf)?;
            Ok(buf)
        }
    }
}

/// Decode bytes to a value using the specified format.
pub fn decode<T: DeserializeOwned>(data: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => serde_json::from_slice(data).map_err(Error::from),
        Format::Cbor => ciborium::from_reader(data).map_err(|e| Error::Cbor(e.to_string())),
    }
}

/// Try to auto-detect the format from the data.
///
/// Returns `Json` if the data starts with `{` or `[`, otherwise `Cbor`.
pub fn detect_format(data: &[u8]) -> Format {
    match data.first() {
        Some(b'{') | Some(b'[') => Format::Json,
        _ => Format::Cbor,
    }
}

/// Decode bytes, auto-detecting the format.
///
/// The consuming side cannot assume which format a publishing node was
/// configured with, so birth and data handlers go through this.
pub fn decode_auto<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let format = detect_format(data);
    decode(data, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricValue;
    use crate::sparkplug::{Payload, PayloadMetric};

    fn sample_payload() -> Payload {
        Payload::new(
            1700000000000,
            vec![
                PayloadMetric::command("Node Control/Rebirth", false, 1700000000000),
                PayloadMetric {
                    name: None,
                    alias: Some(4),
                    datatype: None,
                    value: Some(MetricValue::Float(20.5)),
                    timestamp: 1700000000001,
                    is_transient: false,
                    properties: None,
                },
            ],
        )
    }

    #[test]
    fn test_json_roundtrip() {
        let payload = sample_payload();

        let encoded = encode(&payload, Format::Json).unwrap();
        let decoded: Payload = decode(&encoded, Format::Json).unwrap();

        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_cbor_roundtrip() {
        let payload = sample_payload();

        let encoded = encode(&payload, Format::Cbor).unwrap();
        let decoded: Payload = decode(&encoded, Format::Cbor).unwrap();

        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_auto_decode() {
        let payload = sample_payload();

        let json = encode(&payload, Format::Json).unwrap();
        let decoded: Payload = decode_auto(&json).unwrap();
        assert_eq!(payload, decoded);

        let cbor = encode(&payload, Format::Cbor).unwrap();
        let decoded: Payload = decode_auto(&cbor).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(detect_format(b"{\"timestamp\": 0}"), Format::Json);
        assert_eq!(detect_format(b"[1, 2, 3]"), Format::Json);
        assert_eq!(detect_format(b"\xa1\x63key\x65value"), Format::Cbor);
    }
}
