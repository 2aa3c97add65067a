//! Fieldlink ingester.
//!
//! Subscribes to the bus, tracks the alias tables announced in birth
//! messages, decodes data messages back into named records and batches them
//! for a downstream sink:
//!
//! - [`config`] - Ingester configuration (JSON5 file)
//! - [`resolver`] - Per-device alias tables with birth debounce
//! - [`batch`] - Record batching and sink delivery

pub mod batch;
pub mod config;
pub mod resolver;

pub use batch::{BatchConfig, Batcher, LogSink, MqttSink, RecordSink};
pub use config::{IngesterConfig, SinkConfig};
pub use resolver::{AliasResolver, AliasTable, DeviceKey, UnsRecord};
