//! Alias resolution for the consuming side of the bus.
//!
//! Data messages carry only aliases; the resolver keeps one alias table per
//! publishing device, built from the most recent birth message, and turns
//! alias/value pairs back into named records. An alias missing from the
//! current table is never guessed at; the entry is dropped and a rebirth is
//! requested instead.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use fieldlink_common::boundedset::BoundedKeySet;
use fieldlink_common::metric::{DataType, MetricValue};
use fieldlink_common::sparkplug::{Payload, Topic};

/// Key identifying a publishing device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub group: String,
    pub node: String,
    pub device: String,
}

impl DeviceKey {
    /// Extract the key from a device-level topic.
    pub fn from_topic(topic: &Topic) -> Option<Self> {
        Some(Self {
            group: topic.group.clone(),
            node: topic.node.clone(),
            device: topic.device.clone()?,
        })
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.node, self.device)
    }
}

/// What a birth message told us about one alias.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasEntry {
    pub path: String,
    pub datatype: Option<DataType>,
    pub unit: Option<String>,
    pub transient: bool,
}

/// The alias table for one device.
///
/// Built in one step from a birth payload and swapped in whole; readers
/// never see a partially filled table.
#[derive(Debug, Default)]
pub struct AliasTable {
    entries: HashMap<u64, AliasEntry>,
}

impl AliasTable {
    /// Build a table from a birth payload.
    ///
    /// Entries without both a name and an alias cannot be referenced by
    /// data messages and are skipped.
    pub fn from_payload(payload: &Payload) -> Self {
        let mut entries = HashMap::new();
        for metric in &payload.metrics {
            let (Some(name), Some(alias)) = (&metric.name, metric.alias) else {
                continue;
            };
            entries.insert(
                alias,
                AliasEntry {
                    path: name.clone(),
                    datatype: metric.datatype,
                    unit: metric
                        .properties
                        .as_ref()
                        .and_then(|p| p.eng_unit.clone()),
                    transient: metric.is_transient,
                },
            );
        }
        Self { entries }
    }

    pub fn resolve(&self, alias: u64) -> Option<&AliasEntry> {
        self.entries.get(&alias)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A decoded record bound for the downstream sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnsRecord {
    pub group: String,
    pub node: String,
    pub device: String,
    pub path: String,
    pub value: MetricValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datatype: Option<DataType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub transient: bool,
    pub timestamp: i64,
}

/// Result of decoding one data message.
#[derive(Debug, Default)]
pub struct Decoded {
    pub records: Vec<UnsRecord>,
    /// Whether the caller should request a rebirth for this key. At most
    /// one request per key per debounce window.
    pub request_rebirth: bool,
}

/// Tracks one alias table per device observed on the bus.
pub struct AliasResolver {
    tables: HashMap<DeviceKey, AliasTable>,
    birth_debounce: HashMap<DeviceKey, Instant>,
    rebirth_pending: HashMap<DeviceKey, Instant>,
    seen: BoundedKeySet<DeviceKey>,
    window: Duration,
    rebuilds: u64,
}

impl AliasResolver {
    /// `window` debounces both repeated births and repeated rebirth
    /// requests; `max_devices` bounds how many devices are tracked.
    pub fn new(window: Duration, max_devices: usize) -> Self {
        Self {
            tables: HashMap::new(),
            birth_debounce: HashMap::new(),
            rebirth_pending: HashMap::new(),
            seen: BoundedKeySet::new(max_devices),
            window,
            rebuilds: 0,
        }
    }

    /// Number of table rebuilds performed so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Number of devices with a current table.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Handle a device birth. Returns whether the table was rebuilt.
    ///
    /// Bursts of births for the same key inside the debounce window
    /// collapse into a single rebuild.
    pub fn handle_birth(&mut self, key: DeviceKey, payload: &Payload, now: Instant) -> bool {
        if let Some(deadline) = self.birth_debounce.get(&key)
            && now < *deadline
        {
            debug!(key = %key, "Birth inside debounce window, collapsed");
            return false;
        }

        if !self.seen.contains(&key) && !self.seen.insert(key.clone()) {
            warn!(key = %key, "Device limit reached, ignoring birth");
            return false;
        }

        let table = AliasTable::from_payload(payload);
        info!(key = %key, aliases = table.len(), "Alias table rebuilt");
        self.tables.insert(key.clone(), table);
        self.birth_debounce.insert(key.clone(), now + self.window);
        self.rebirth_pending.remove(&key);
        self.rebuilds += 1;
        true
    }

    /// Handle a death message. A device death drops that device's table; a
    /// node death drops every table the node published.
    pub fn handle_death(&mut self, topic: &Topic) {
        match &topic.device {
            Some(device) => {
                let key = DeviceKey {
                    group: topic.group.clone(),
                    node: topic.node.clone(),
                    device: device.clone(),
                };
                info!(key = %key, "Device death, dropping alias table");
                self.tables.remove(&key);
                self.birth_debounce.remove(&key);
                self.rebirth_pending.remove(&key);
            }
            None => {
                info!(group = %topic.group, node = %topic.node, "Node death, dropping its alias tables");
                let matches =
                    |key: &DeviceKey| key.group == topic.group && key.node == topic.node;
                self.tables.retain(|key, _| !matches(key));
                self.birth_debounce.retain(|key, _| !matches(key));
                self.rebirth_pending.retain(|key, _| !matches(key));
            }
        }
    }

    /// Decode a data message against the current table for its key.
    pub fn handle_data(&mut self, key: &DeviceKey, payload: &Payload, now: Instant) -> Decoded {
        let Some(table) = self.tables.get(key) else {
            debug!(key = %key, "Data for unknown device");
            return Decoded {
                records: Vec::new(),
                request_rebirth: self.mark_rebirth(key.clone(), now),
            };
        };

        let mut records = Vec::new();
        let mut unknown_alias = false;

        for metric in &payload.metrics {
            let Some(value) = metric.value.clone() else {
                continue;
            };
            let Some(alias) = metric.alias else {
                warn!(key = %key, "Data entry without alias, dropping");
                continue;
            };

            match table.resolve(alias) {
                Some(entry) => {
                    // Control paths are bus plumbing, not plant data
                    if entry.path.starts_with("Device Control")
                        || entry.path.starts_with("Node Control")
                    {
                        continue;
                    }
                    records.push(UnsRecord {
                        group: key.group.clone(),
                        node: key.node.clone(),
                        device: key.device.clone(),
                        path: entry.path.clone(),
                        value,
                        datatype: entry.datatype,
                        unit: entry.unit.clone(),
                        transient: entry.transient,
                        timestamp: metric.timestamp,
                    });
                }
                None => {
                    warn!(key = %key, alias, "Unknown alias, dropping entry");
                    unknown_alias = true;
                }
            }
        }

        let request_rebirth = unknown_alias && self.mark_rebirth(key.clone(), now);
        Decoded {
            records,
            request_rebirth,
        }
    }

    /// Drop all cached state. A transport reconnect invalidates every
    /// cached alias, since a differently-ordered birth may follow.
    pub fn reset(&mut self) {
        if !self.tables.is_empty() {
            info!(tables = self.tables.len(), "Session boundary, resetting alias tables");
        }
        self.tables.clear();
        self.birth_debounce.clear();
        self.rebirth_pending.clear();
    }

    fn mark_rebirth(&mut self, key: DeviceKey, now: Instant) -> bool {
        if let Some(deadline) = self.rebirth_pending.get(&key)
            && now < *deadline
        {
            return false;
        }
        self.rebirth_pending.insert(key, now + self.window);
        true
    }
}
