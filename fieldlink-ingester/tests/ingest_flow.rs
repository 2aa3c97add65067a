//! End-to-end decode path: wire payloads through the resolver into a sink.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use fieldlink_common::metric::{DataType, Metric, MetricValue};
use fieldlink_common::serialization::{Format, decode_auto, encode};
use fieldlink_common::sparkplug::{Payload, PayloadMetric};

use fieldlink_ingester::batch::{Batcher, RecordSink};
use fieldlink_ingester::resolver::{AliasResolver, DeviceKey, UnsRecord};

struct VecSink {
    records: Vec<UnsRecord>,
}

#[async_trait]
impl RecordSink for VecSink {
    async fn flush(&mut self, records: &[UnsRecord]) -> anyhow::Result<()> {
        self.records.extend_from_slice(records);
        Ok(())
    }
}

fn key() -> DeviceKey {
    DeviceKey {
        group: "PlantA".to_string(),
        node: "edge01".to_string(),
        device: "press-3".to_string(),
    }
}

/// Build the payloads the way the publishing side does, push them through
/// the serialization layer and hand the decoded form to the resolver.
fn wire_roundtrip(payload: &Payload, format: Format) -> Payload {
    let bytes = encode(payload, format).unwrap();
    decode_auto(&bytes).unwrap()
}

#[tokio::test]
async fn birth_then_data_flows_to_the_sink() {
    let mut resolver = AliasResolver::new(Duration::from_millis(100), 64);
    let mut batcher = Batcher::new(10);
    let mut sink = VecSink {
        records: Vec::new(),
    };
    let now = Instant::now();

    let mut metric = Metric::new("Hydraulics/Pressure", DataType::Float);
    metric.alias = Some(4);
    metric.set_value(MetricValue::Float(98.5), 1000);

    let birth = wire_roundtrip(
        &Payload::new(1000, vec![PayloadMetric::birth(&metric)]),
        Format::Cbor,
    );
    assert!(resolver.handle_birth(key(), &birth, now));

    metric.set_value(MetricValue::Float(99.25), 2000);
    let data = wire_roundtrip(
        &Payload::new(2000, vec![PayloadMetric::data(&metric)]),
        Format::Cbor,
    );
    let decoded = resolver.handle_data(&key(), &data, now);
    assert!(!decoded.request_rebirth);

    for record in decoded.records {
        batcher.push(record);
    }
    batcher.flush(&mut sink).await.unwrap();

    assert_eq!(sink.records.len(), 1);
    let record = &sink.records[0];
    assert_eq!(record.path, "Hydraulics/Pressure");
    assert_eq!(record.value, MetricValue::Float(99.25));
    assert_eq!(record.device, "press-3");
    assert_eq!(record.timestamp, 2000);
}

#[tokio::test]
async fn stale_alias_never_reaches_the_sink() {
    let mut resolver = AliasResolver::new(Duration::from_millis(100), 64);
    let mut batcher = Batcher::new(10);
    let mut sink = VecSink {
        records: Vec::new(),
    };
    let now = Instant::now();

    let mut metric = Metric::new("Hydraulics/Pressure", DataType::Float);
    metric.alias = Some(4);
    let birth = wire_roundtrip(
        &Payload::new(1000, vec![PayloadMetric::birth(&metric)]),
        Format::Json,
    );
    resolver.handle_birth(key(), &birth, now);

    // Data referencing an alias the current table never announced
    let mut stale = metric.clone();
    stale.alias = Some(99);
    stale.set_value(MetricValue::Float(1.0), 2000);
    let data = wire_roundtrip(
        &Payload::new(2000, vec![PayloadMetric::data(&stale)]),
        Format::Json,
    );

    let decoded = resolver.handle_data(&key(), &data, now);
    assert!(decoded.records.is_empty());
    assert!(decoded.request_rebirth);

    batcher.flush(&mut sink).await.unwrap();
    assert!(sink.records.is_empty());
}
