use serde::{Deserialize, Serialize};

/// Declared datatype of a metric.
///
/// Config files spell these in lowercase (`"float"`, `"uint16"`, ...),
/// optionally followed by a `BE`/`LE` byte-order suffix which is split off
/// by [`parse_type`] before the datatype is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Int16,
    Int32,
    Int64,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    #[serde(rename = "string")]
    Text,
}

impl DataType {
    /// Parse a bare datatype name (no byte-order suffix). Case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Some(DataType::Boolean),
            "int16" => Some(DataType::Int16),
            "int32" => Some(DataType::Int32),
            "int64" => Some(DataType::Int64),
            "uint16" => Some(DataType::UInt16),
            "uint32" => Some(DataType::UInt32),
            "uint64" => Some(DataType::UInt64),
            "float" => Some(DataType::Float),
            "double" => Some(DataType::Double),
            "string" | "text" => Some(DataType::Text),
            _ => None,
        }
    }

    /// Width in bytes of the raw encoding, or `None` for variable-width types.
    pub fn width(&self) -> Option<usize> {
        match self {
            DataType::Boolean => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Double => Some(8),
            DataType::Text => None,
        }
    }
}

/// Byte order of a raw device reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    #[serde(rename = "BE")]
    Big,
    #[serde(rename = "LE")]
    Little,
}

impl ByteOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            ByteOrder::Big => "BE",
            ByteOrder::Little => "LE",
        }
    }
}

/// Split a raw config type tag into datatype and optional byte order.
///
/// The suffix may be appended directly (`"floatBE"`) or separated by a comma
/// (`"float,BE"`). Returns `None` when the base type is unknown.
pub fn parse_type(raw: &str) -> Option<(DataType, Option<ByteOrder>)> {
    let trimmed = raw.trim();
    let (base, order) = if let Some(base) = trimmed.strip_suffix("BE") {
        (base, Some(ByteOrder::Big))
    } else if let Some(base) = trimmed.strip_suffix("LE") {
        (base, Some(ByteOrder::Little))
    } else {
        (trimmed, None)
    };

    let base = base.trim_end_matches([',', ' ']);
    let datatype = DataType::parse(base)?;
    Some((datatype, order))
}

/// Typed metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Bool(_) | MetricValue::Text(_) => None,
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::UInt(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v),
        }
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::UInt(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

/// Decode a raw device reading into a typed value.
///
/// The byte slice must be at least as wide as the datatype; excess bytes are
/// ignored so drivers may return whole register blocks. Returns `None` when
/// the reading is too short.
pub fn decode_value(bytes: &[u8], datatype: DataType, order: ByteOrder) -> Option<MetricValue> {
    fn take<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
        bytes.get(..N)?.try_into().ok()
    }

    let value = match (datatype, order) {
        (DataType::Boolean, _) => MetricValue::Bool(*bytes.first()? != 0),
        (DataType::Int16, ByteOrder::Big) => MetricValue::Int(i16::from_be_bytes(take(bytes)?) as i64),
        (DataType::Int16, ByteOrder::Little) => {
            MetricValue::Int(i16::from_le_bytes(take(bytes)?) as i64)
        }
        (DataType::Int32, ByteOrder::Big) => MetricValue::Int(i32::from_be_bytes(take(bytes)?) as i64),
        (DataType::Int32, ByteOrder::Little) => {
            MetricValue::Int(i32::from_le_bytes(take(bytes)?) as i64)
        }
        (DataType::Int64, ByteOrder::Big) => MetricValue::Int(i64::from_be_bytes(take(bytes)?)),
        (DataType::Int64, ByteOrder::Little) => MetricValue::Int(i64::from_le_bytes(take(bytes)?)),
        (DataType::UInt16, ByteOrder::Big) => {
            MetricValue::UInt(u16::from_be_bytes(take(bytes)?) as u64)
        }
        (DataType::UInt16, ByteOrder::Little) => {
            MetricValue::UInt(u16::from_le_bytes(take(bytes)?) as u64)
        }
        (DataType::UInt32, ByteOrder::Big) => {
            MetricValue::UInt(u32::from_be_bytes(take(bytes)?) as u64)
        }
        (DataType::UInt32, ByteOrder::Little) => {
            MetricValue::UInt(u32::from_le_bytes(take(bytes)?) as u64)
        }
        (DataType::UInt64, ByteOrder::Big) => MetricValue::UInt(u64::from_be_bytes(take(bytes)?)),
        (DataType::UInt64, ByteOrder::Little) => MetricValue::UInt(u64::from_le_bytes(take(bytes)?)),
        (DataType::Float, ByteOrder::Big) => {
            MetricValue::Float(f32::from_be_bytes(take(bytes)?) as f64)
        }
        (DataType::Float, ByteOrder::Little) => {
            MetricValue::Float(f32::from_le_bytes(take(bytes)?) as f64)
        }
        (DataType::Double, ByteOrder::Big) => MetricValue::Float(f64::from_be_bytes(take(bytes)?)),
        (DataType::Double, ByteOrder::Little) => {
            MetricValue::Float(f64::from_le_bytes(take(bytes)?))
        }
        (DataType::Text, _) => MetricValue::Text(String::from_utf8_lossy(bytes).into_owned()),
    };

    Some(value)
}

/// Descriptive metadata attached to a metric.
///
/// Carried in full on birth messages and omitted from data messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eng_unit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eng_low: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eng_high: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadband: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tooltip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endianness: Option<ByteOrder>,
}

/// A single metric owned by the translator.
///
/// Built once per configured tag at config-load time; only the value and
/// timestamp change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,

    /// Session-scoped wire alias, assigned on birth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<u64>,

    pub datatype: DataType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<MetricValue>,

    pub timestamp: i64,

    /// Transient metrics are not persisted by downstream consumers.
    #[serde(default)]
    pub is_transient: bool,

    #[serde(default)]
    pub properties: MetricProperties,
}

impl Metric {
    /// Create a new metric with no value and the current timestamp.
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        Self {
            name: name.into(),
            alias: None,
            datatype,
            value: None,
            timestamp: current_timestamp_millis(),
            is_transient: false,
            properties: MetricProperties::default(),
        }
    }

    /// Set the initial value.
    pub fn with_value(mut self, value: impl Into<MetricValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Mark the metric as transient.
    pub fn with_transient(mut self, transient: bool) -> Self {
        self.is_transient = transient;
        self
    }

    /// Attach a property bag.
    pub fn with_properties(mut self, properties: MetricProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Update the value, returning whether it changed.
    ///
    /// The timestamp is refreshed on every call so repeated identical
    /// readings still record when the device was last seen.
    pub fn set_value(&mut self, value: MetricValue, timestamp: i64) -> bool {
        self.timestamp = timestamp;
        if self.value.as_ref() == Some(&value) {
            return false;
        }
        self.value = Some(value);
        true
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type_plain() {
        assert_eq!(parse_type("float"), Some((DataType::Float, None)));
        assert_eq!(parse_type("uint16"), Some((DataType::UInt16, None)));
        assert_eq!(parse_type("Boolean"), Some((DataType::Boolean, None)));
    }

    #[test]
    fn test_parse_type_with_byte_order() {
        assert_eq!(
            parse_type("floatBE"),
            Some((DataType::Float, Some(ByteOrder::Big)))
        );
        assert_eq!(
            parse_type("float,BE"),
            Some((DataType::Float, Some(ByteOrder::Big)))
        );
        assert_eq!(
            parse_type("uint32LE"),
            Some((DataType::UInt32, Some(ByteOrder::Little)))
        );
    }

    #[test]
    fn test_parse_type_unknown() {
        assert_eq!(parse_type("complex128"), None);
        assert_eq!(parse_type(""), None);
        assert_eq!(parse_type("BE"), None);
    }

    #[test]
    fn test_decode_f32_big_endian() {
        // 123.456 in IEEE 754 is 0x42F6E979
        let bytes = [0x42, 0xF6, 0xE9, 0x79];
        let value = decode_value(&bytes, DataType::Float, ByteOrder::Big).unwrap();

        match value {
            MetricValue::Float(v) => assert!((v - 123.456).abs() < 0.001),
            other => panic!("Expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_f32_little_endian() {
        let bytes = [0x79, 0xE9, 0xF6, 0x42];
        let value = decode_value(&bytes, DataType::Float, ByteOrder::Little).unwrap();

        match value {
            MetricValue::Float(v) => assert!((v - 123.456).abs() < 0.001),
            other => panic!("Expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_integers() {
        assert_eq!(
            decode_value(&[0x01, 0x02], DataType::UInt16, ByteOrder::Big),
            Some(MetricValue::UInt(0x0102))
        );
        assert_eq!(
            decode_value(&[0xFF, 0xFE], DataType::Int16, ByteOrder::Big),
            Some(MetricValue::Int(-2))
        );
        assert_eq!(
            decode_value(&[0x01], DataType::Boolean, ByteOrder::Big),
            Some(MetricValue::Bool(true))
        );
    }

    #[test]
    fn test_decode_short_reading() {
        assert_eq!(decode_value(&[0x01], DataType::Float, ByteOrder::Big), None);
        assert_eq!(decode_value(&[], DataType::Boolean, ByteOrder::Big), None);
    }

    #[test]
    fn test_set_value_change_detection() {
        let mut metric = Metric::new("Line 1/Pressure", DataType::Float);

        assert!(metric.set_value(MetricValue::Float(1.5), 1000));
        assert!(!metric.set_value(MetricValue::Float(1.5), 2000));
        // Timestamp refreshed even without a change
        assert_eq!(metric.timestamp, 2000);
        assert!(metric.set_value(MetricValue::Float(2.0), 3000));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(MetricValue::from(true), MetricValue::Bool(true));
        assert_eq!(MetricValue::from(3.25), MetricValue::Float(3.25));
        assert_eq!(MetricValue::from(42u64).as_f64(), Some(42.0));
        assert_eq!(MetricValue::from("idle").as_f64(), None);
    }
}
