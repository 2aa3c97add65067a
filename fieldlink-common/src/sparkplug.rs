use serde::{Deserialize, Serialize};
use std::fmt;

use crate::metric::{DataType, Metric, MetricProperties, MetricValue};

/// Default topic namespace for all Fieldlink traffic.
pub const DEFAULT_NAMESPACE: &str = "flBv1";

/// Message types carried in the topic.
///
/// Topics follow the pattern:
/// `<namespace>/<group>/<type>/<node>[/<device>]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    NBirth,
    DBirth,
    NData,
    DData,
    NDeath,
    DDeath,
    NCmd,
    DCmd,
}

impl MessageKind {
    /// Get the string representation used in topics.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::NBirth => "NBIRTH",
            MessageKind::DBirth => "DBIRTH",
            MessageKind::NData => "NDATA",
            MessageKind::DData => "DDATA",
            MessageKind::NDeath => "NDEATH",
            MessageKind::DDeath => "DDEATH",
            MessageKind::NCmd => "NCMD",
            MessageKind::DCmd => "DCMD",
        }
    }

    /// Parse a topic segment into a message kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NBIRTH" => Some(MessageKind::NBirth),
            "DBIRTH" => Some(MessageKind::DBirth),
            "NDATA" => Some(MessageKind::NData),
            "DDATA" => Some(MessageKind::DData),
            "NDEATH" => Some(MessageKind::NDeath),
            "DDEATH" => Some(MessageKind::DDeath),
            "NCMD" => Some(MessageKind::NCmd),
            "DCMD" => Some(MessageKind::DCmd),
            _ => None,
        }
    }

    /// Whether this kind addresses a device (carries a device segment).
    pub fn is_device(&self) -> bool {
        matches!(
            self,
            MessageKind::DBirth | MessageKind::DData | MessageKind::DDeath | MessageKind::DCmd
        )
    }

    pub fn is_birth(&self) -> bool {
        matches!(self, MessageKind::NBirth | MessageKind::DBirth)
    }

    pub fn is_death(&self) -> bool {
        matches!(self, MessageKind::NDeath | MessageKind::DDeath)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, MessageKind::NData | MessageKind::DData)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed bus topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub namespace: String,
    pub group: String,
    pub kind: MessageKind,
    pub node: String,
    pub device: Option<String>,
}

impl Topic {
    /// Build a node-level topic.
    pub fn node(
        namespace: impl Into<String>,
        group: impl Into<String>,
        kind: MessageKind,
        node: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            kind,
            node: node.into(),
            device: None,
        }
    }

    /// Build a device-level topic.
    pub fn device(
        namespace: impl Into<String>,
        group: impl Into<String>,
        kind: MessageKind,
        node: impl Into<String>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            kind,
            node: node.into(),
            device: Some(device.into()),
        }
    }

    /// Parse a topic string.
    ///
    /// Returns `None` when the segment count does not match the message kind,
    /// so a device kind without a device segment never parses.
    pub fn parse(topic: &str) -> Option<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 4 || parts.len() > 5 {
            return None;
        }

        let kind = MessageKind::parse(parts[2])?;
        let device = match (kind.is_device(), parts.len()) {
            (true, 5) => Some(parts[4].to_string()),
            (false, 4) => None,
            _ => return None,
        };

        if parts[0].is_empty() || parts[1].is_empty() || parts[3].is_empty() {
            return None;
        }

        Some(Self {
            namespace: parts[0].to_string(),
            group: parts[1].to_string(),
            kind,
            node: parts[3].to_string(),
            device,
        })
    }

    /// Subscription filter matching all traffic in a namespace.
    pub fn namespace_wildcard(namespace: &str) -> String {
        format!("{}/#", namespace)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device {
            Some(device) => write!(
                f,
                "{}/{}/{}/{}/{}",
                self.namespace, self.group, self.kind, self.node, device
            ),
            None => write!(
                f,
                "{}/{}/{}/{}",
                self.namespace, self.group, self.kind, self.node
            ),
        }
    }
}

/// One metric entry in a wire payload.
///
/// Birth messages carry the full entry; data messages carry only alias,
/// value and timestamp to keep the wire size down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetric {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<DataType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<MetricValue>,

    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_transient: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<MetricProperties>,
}

impl PayloadMetric {
    /// Full entry for a birth message.
    pub fn birth(metric: &Metric) -> Self {
        Self {
            name: Some(metric.name.clone()),
            alias: metric.alias,
            datatype: Some(metric.datatype),
            value: metric.value.clone(),
            timestamp: metric.timestamp,
            is_transient: metric.is_transient,
            properties: Some(metric.properties.clone()),
        }
    }

    /// Compact entry for a data message. The name is deliberately omitted.
    pub fn data(metric: &Metric) -> Self {
        Self {
            name: None,
            alias: metric.alias,
            datatype: None,
            value: metric.value.clone(),
            timestamp: metric.timestamp,
            is_transient: false,
            properties: None,
        }
    }

    /// Entry for a command message, addressed by name.
    pub fn command(name: impl Into<String>, value: impl Into<MetricValue>, timestamp: i64) -> Self {
        Self {
            name: Some(name.into()),
            alias: None,
            datatype: None,
            value: Some(value.into()),
            timestamp,
            is_transient: false,
            properties: None,
        }
    }
}

/// A wire payload: a timestamp and an ordered list of metric entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub timestamp: i64,
    pub metrics: Vec<PayloadMetric>,
}

impl Payload {
    pub fn new(timestamp: i64, metrics: Vec<PayloadMetric>) -> Self {
        Self { timestamp, metrics }
    }

    /// Find a metric entry by name.
    pub fn metric_by_name(&self, name: &str) -> Option<&PayloadMetric> {
        self.metrics
            .iter()
            .find(|m| m.name.as_deref() == Some(name))
    }
}

/// Well-known command metric names.
pub mod commands {
    /// Node command requesting a full rebirth (NBIRTH plus all DBIRTHs).
    pub const NODE_REBIRTH: &str = "Node Control/Rebirth";
    /// Node command requesting a configuration reload.
    pub const NODE_RELOAD_CONFIG: &str = "Node Control/Reload Config";
    /// Device command requesting a single DBIRTH.
    pub const DEVICE_REBIRTH: &str = "Device Control/Rebirth";
}
