//! Fieldlink ingester binary.
//!
//! Subscribes to the whole namespace, rebuilds alias tables from birth
//! messages, decodes data messages into named records and batches them into
//! the configured sink.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use rumqttc::QoS;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use fieldlink_common::metric::current_timestamp_millis;
use fieldlink_common::serialization::{Format, decode_auto, encode};
use fieldlink_common::sparkplug::{MessageKind, Payload, PayloadMetric, Topic, commands};
use fieldlink_common::transport::{Transport, TransportEvent};
use fieldlink_common::LoggingConfig;

use fieldlink_ingester::batch::{Batcher, LogSink, MqttSink, RecordSink};
use fieldlink_ingester::config::{IngesterConfig, SinkConfig};
use fieldlink_ingester::resolver::{AliasResolver, DeviceKey};

/// Rebuilds the semantic metric stream from the bus.
#[derive(Parser, Debug)]
#[command(name = "fieldlink-ingester")]
#[command(about = "Decodes bus traffic into named records for a downstream sink")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "ingester.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = IngesterConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    fieldlink_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting fieldlink-ingester {}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", args.config);

    let client_id = format!("fieldlink-ingester-{:x}", current_timestamp_millis());
    let (transport, mut events) = Transport::connect(&config.mqtt, &client_id, None);

    let mut resolver = AliasResolver::new(
        Duration::from_millis(config.birth_debounce_ms),
        config.max_devices,
    );
    let mut batcher = Batcher::new(config.batch.max_records);
    let mut sink: Box<dyn RecordSink> = match &config.sink {
        SinkConfig::Log => Box::new(LogSink),
        SinkConfig::Mqtt { topic } => Box::new(MqttSink::new(transport.clone(), topic.clone())),
    };

    let mut flush_interval =
        tokio::time::interval(Duration::from_millis(config.batch.flush_interval_ms));
    flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                TransportEvent::Connected => {
                    info!("Connected to broker, subscribing to namespace");
                    let filter = Topic::namespace_wildcard(&config.namespace);
                    if let Err(e) = transport.subscribe(&filter, QoS::AtLeastOnce).await {
                        warn!(filter = %filter, error = %e, "Subscription failed");
                    }
                    // Aliases from the previous session are meaningless now
                    resolver.reset();
                }
                TransportEvent::Disconnected => {
                    warn!("Lost broker connection");
                }
                TransportEvent::Message { topic, payload } => {
                    handle_message(
                        &config.namespace,
                        &topic,
                        &payload,
                        &mut resolver,
                        &mut batcher,
                        sink.as_mut(),
                        &transport,
                    )
                    .await;
                }
            },
            _ = flush_interval.tick() => {
                if let Err(e) = batcher.flush(sink.as_mut()).await {
                    warn!(error = %e, pending = batcher.len(), "Flush failed, batch retained");
                }
            }
            _ = sigterm.recv() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down");
    if let Err(e) = batcher.flush(sink.as_mut()).await {
        warn!(error = %e, dropped = batcher.len(), "Final flush failed");
    }
    transport.disconnect().await;
    info!("Ingester stopped");

    Ok(())
}

async fn handle_message(
    namespace: &str,
    topic: &str,
    payload: &[u8],
    resolver: &mut AliasResolver,
    batcher: &mut Batcher,
    sink: &mut dyn RecordSink,
    transport: &Transport,
) {
    let Some(topic) = Topic::parse(topic) else {
        warn!(topic, "Ignoring message on unparseable topic");
        return;
    };
    if topic.namespace != namespace {
        return;
    }

    match topic.kind {
        MessageKind::DBirth => {
            let Some(payload) = decode_payload(&topic, payload) else {
                return;
            };
            let Some(key) = DeviceKey::from_topic(&topic) else {
                return;
            };
            resolver.handle_birth(key, &payload, Instant::now());
        }
        MessageKind::NDeath | MessageKind::DDeath => {
            resolver.handle_death(&topic);
        }
        MessageKind::DData => {
            let Some(key) = DeviceKey::from_topic(&topic) else {
                return;
            };
            let Some(payload) = decode_payload(&topic, payload) else {
                // A device whose payloads we cannot read needs a fresh
                // birth, not guesswork
                request_rebirth(transport, &topic, &key).await;
                return;
            };

            let decoded = resolver.handle_data(&key, &payload, Instant::now());
            for record in decoded.records {
                if batcher.push(record)
                    && let Err(e) = batcher.flush(sink).await
                {
                    warn!(error = %e, pending = batcher.len(), "Flush failed, batch retained");
                }
            }
            if decoded.request_rebirth {
                request_rebirth(transport, &topic, &key).await;
            }
        }
        // Node births and node data carry bus plumbing, not plant data;
        // commands are for the publishing nodes
        MessageKind::NBirth | MessageKind::NData | MessageKind::NCmd | MessageKind::DCmd => {}
    }
}

fn decode_payload(topic: &Topic, payload: &[u8]) -> Option<Payload> {
    match decode_auto::<Payload>(payload) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(topic = %topic, error = %e, "Dropping malformed payload");
            None
        }
    }
}

/// Ask a device for a fresh birth certificate.
async fn request_rebirth(transport: &Transport, topic: &Topic, key: &DeviceKey) {
    let command = Topic::device(
        &topic.namespace,
        &key.group,
        MessageKind::DCmd,
        &key.node,
        &key.device,
    );
    let now = current_timestamp_millis();
    let payload = Payload::new(
        now,
        vec![PayloadMetric::command(commands::DEVICE_REBIRTH, true, now)],
    );

    match encode(&payload, Format::Json) {
        Ok(bytes) => {
            info!(key = %key, "Requesting rebirth");
            if let Err(e) = transport
                .publish(&command.to_string(), bytes, QoS::AtLeastOnce)
                .await
            {
                warn!(key = %key, error = %e, "Rebirth request failed");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode rebirth request"),
    }
}
