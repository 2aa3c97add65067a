//! Record batching and delivery to the downstream sink.

use async_trait::async_trait;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fieldlink_common::transport::Transport;

use crate::resolver::UnsRecord;

/// Batch sizing and flush cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush as soon as this many records have accumulated.
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Flush at least this often, full or not.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_max_records() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    2000
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Where flushed records go.
#[async_trait]
pub trait RecordSink: Send {
    /// Deliver a batch. An error leaves the batch with the caller, so
    /// delivery is at-least-once rather than exactly-once.
    async fn flush(&mut self, records: &[UnsRecord]) -> anyhow::Result<()>;
}

/// Accumulates decoded records until a flush.
pub struct Batcher {
    records: Vec<UnsRecord>,
    max_records: usize,
}

impl Batcher {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Vec::new(),
            max_records,
        }
    }

    /// Append a record. Returns `true` once the size threshold is reached
    /// and the caller should flush.
    pub fn push(&mut self, record: UnsRecord) -> bool {
        self.records.push(record);
        self.records.len() >= self.max_records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Flush the batch to the sink.
    ///
    /// On success the batch is cleared; on failure it is left intact for
    /// the next attempt. Returns the number of records delivered.
    pub async fn flush(&mut self, sink: &mut dyn RecordSink) -> anyhow::Result<usize> {
        if self.records.is_empty() {
            return Ok(0);
        }

        sink.flush(&self.records).await?;
        let delivered = self.records.len();
        self.records.clear();
        debug!(delivered, "Batch flushed");
        Ok(delivered)
    }
}

/// Development sink that logs records instead of delivering them.
pub struct LogSink;

#[async_trait]
impl RecordSink for LogSink {
    async fn flush(&mut self, records: &[UnsRecord]) -> anyhow::Result<()> {
        for record in records {
            info!(
                device = %format!("{}/{}/{}", record.group, record.node, record.device),
                path = %record.path,
                value = ?record.value,
                "Record"
            );
        }
        Ok(())
    }
}

/// Sink publishing each record as JSON to a bus topic.
pub struct MqttSink {
    transport: Transport,
    topic: String,
}

impl MqttSink {
    pub fn new(transport: Transport, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl RecordSink for MqttSink {
    async fn flush(&mut self, records: &[UnsRecord]) -> anyhow::Result<()> {
        for record in records {
            let payload = serde_json::to_vec(record)?;
            self.transport
                .publish(&self.topic, payload, QoS::AtLeastOnce)
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlink_common::metric::MetricValue;

    fn record(path: &str) -> UnsRecord {
        UnsRecord {
            group: "PlantA".to_string(),
            node: "edge01".to_string(),
            device: "press-3".to_string(),
            path: path.to_string(),
            value: MetricValue::Float(1.0),
            datatype: None,
            unit: None,
            transient: false,
            timestamp: 1000,
        }
    }

    struct CountingSink {
        flushed: usize,
        fail: bool,
    }

    #[async_trait]
    impl RecordSink for CountingSink {
        async fn flush(&mut self, records: &[UnsRecord]) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("sink unavailable");
            }
            self.flushed += records.len();
            Ok(())
        }
    }

    #[test]
    fn test_push_signals_threshold() {
        let mut batcher = Batcher::new(3);
        assert!(!batcher.push(record("a")));
        assert!(!batcher.push(record("b")));
        assert!(batcher.push(record("c")));
        assert_eq!(batcher.len(), 3);
    }

    #[tokio::test]
    async fn test_flush_clears_batch() {
        let mut batcher = Batcher::new(10);
        batcher.push(record("a"));
        batcher.push(record("b"));

        let mut sink = CountingSink {
            flushed: 0,
            fail: false,
        };
        let delivered = batcher.flush(&mut sink).await.unwrap();

        assert_eq!(delivered, 2);
        assert_eq!(sink.flushed, 2);
        assert!(batcher.is_empty());
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_batch() {
        let mut batcher = Batcher::new(10);
        batcher.push(record("a"));

        let mut sink = CountingSink {
            flushed: 0,
            fail: true,
        };
        assert!(batcher.flush(&mut sink).await.is_err());
        assert_eq!(batcher.len(), 1);

        // The retained records go out on the next attempt
        sink.fail = false;
        let delivered = batcher.flush(&mut sink).await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(sink.flushed, 1);
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let mut batcher = Batcher::new(10);
        let mut sink = CountingSink {
            flushed: 0,
            fail: true,
        };
        // No records means the failing sink is never even called
        assert_eq!(batcher.flush(&mut sink).await.unwrap(), 0);
    }
}
