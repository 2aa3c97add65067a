//! Polling scheduler and lifecycle state machine.
//!
//! The translator turns a fetched configuration into one poller per device
//! connection plus a publisher task. A reload tears the whole set down and
//! rebuilds it from scratch; connections are never partially mutated.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use fieldlink_common::config::MqttConfig;
use fieldlink_common::metric::{
    ByteOrder, DataType, Metric, current_timestamp_millis, decode_value,
};
use fieldlink_common::serialization::{Format, encode};
use fieldlink_common::sparkplug::{MessageKind, Payload, Topic, commands};
use fieldlink_common::transport::Transport;
use fieldlink_common::{Error, Result};

use crate::config::{AgentConfig, DeviceSpec, flatten};
use crate::driver::{Address, ConnectionStatus, Driver};
use crate::drivers::DriverRegistry;
use crate::publisher::{
    DeviceTable, MetricUpdate, PublisherCommand, SparkplugPublisher,
};
use crate::supervisor::ShutdownReason;

/// The node's identity on the bus.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub namespace: String,
    pub group: String,
    pub node: String,
}

impl NodeIdentity {
    pub fn new(
        namespace: impl Into<String>,
        group: impl Into<String>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            node: node.into(),
        }
    }
}

/// Translator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslatorState {
    Stopped,
    Starting,
    Running,
    Reloading,
}

/// A tag resolved against its driver, ready to poll.
#[derive(Debug)]
pub struct PolledTag {
    /// Position of the backing metric in the device's table.
    pub metric_index: usize,
    pub address: Address,
    pub datatype: DataType,
    pub order: ByteOrder,
}

/// A device's pollable tags.
#[derive(Debug)]
pub struct PolledDevice {
    pub device_id: String,
    pub tags: Vec<PolledTag>,
}

type SharedDriver = Arc<Mutex<Box<dyn Driver>>>;

struct ConnectionRuntime {
    name: String,
    driver: SharedDriver,
    poll_interval_ms: u64,
    exclusive: bool,
    devices: Vec<PolledDevice>,
}

/// The polling scheduler.
pub struct Translator {
    identity: NodeIdentity,
    mqtt: MqttConfig,
    registry: DriverRegistry,
    state: TranslatorState,
    cancel: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    publisher_tx: Option<mpsc::Sender<PublisherCommand>>,
    publisher_task: Option<JoinHandle<()>>,
    reload_tx: mpsc::Sender<()>,
    reload_rx: mpsc::Receiver<()>,
}

impl Translator {
    pub fn new(identity: NodeIdentity, mqtt: MqttConfig, registry: DriverRegistry) -> Self {
        let (reload_tx, reload_rx) = mpsc::channel(4);
        Self {
            identity,
            mqtt,
            registry,
            state: TranslatorState::Stopped,
            cancel: None,
            tasks: Vec::new(),
            publisher_tx: None,
            publisher_task: None,
            reload_tx,
            reload_rx,
        }
    }

    pub fn state(&self) -> TranslatorState {
        self.state
    }

    /// Wait for a reload request arriving over the bus.
    pub async fn reload_requested(&mut self) -> Option<()> {
        self.reload_rx.recv().await
    }

    /// Build all connections and devices from the configuration and start
    /// polling.
    pub async fn start(
        &mut self,
        config: &AgentConfig,
        config_revision: Option<String>,
    ) -> Result<()> {
        if self.state != TranslatorState::Stopped {
            return Err(Error::Config("Translator is already running".to_string()));
        }

        // Register an NDEATH as the connection will so an ungraceful
        // disconnect is observable by subscribers.
        let will_topic = Topic::node(
            &self.identity.namespace,
            &self.identity.group,
            MessageKind::NDeath,
            &self.identity.node,
        )
        .to_string();
        let will_payload = encode(
            &Payload::new(current_timestamp_millis(), Vec::new()),
            Format::Json,
        )?;

        self.state = TranslatorState::Starting;
        info!(
            node = %self.identity.node,
            connections = config.connections.len(),
            "Starting translator"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (publisher_tx, publisher_rx) = mpsc::channel(256);
        let client_id = format!(
            "{}-{}-{:x}",
            self.identity.group,
            self.identity.node,
            current_timestamp_millis()
        );
        let (transport, events) =
            Transport::connect(&self.mqtt, &client_id, Some((will_topic, will_payload)));

        let mut connection_names = Vec::new();
        let mut device_tables = Vec::new();
        let mut runtimes = Vec::new();

        for conn in &config.connections {
            let driver = match self.registry.create(&conn.protocol, &conn.params) {
                Ok(driver) => driver,
                Err(e) => {
                    warn!(connection = %conn.name, error = %e, "Skipping connection");
                    continue;
                }
            };

            let mut devices = Vec::new();
            for spec in flatten(conn) {
                let (table, polled) = prepare_device(driver.as_ref(), spec);
                device_tables.push(table);
                devices.push(polled);
            }

            connection_names.push(conn.name.clone());
            runtimes.push(ConnectionRuntime {
                name: conn.name.clone(),
                driver: Arc::new(Mutex::new(driver)),
                poll_interval_ms: conn.poll_interval_ms,
                exclusive: conn.exclusive,
                devices,
            });
        }

        let publisher = SparkplugPublisher::new(
            self.identity.clone(),
            transport,
            events,
            publisher_rx,
            self.reload_tx.clone(),
            config_revision,
            &connection_names,
            device_tables,
        );
        self.publisher_task = Some(tokio::spawn(publisher.run()));

        for runtime in runtimes {
            let tx = publisher_tx.clone();
            let cancel = cancel_rx.clone();
            self.tasks.push(tokio::spawn(run_connection(runtime, tx, cancel)));
        }

        self.publisher_tx = Some(publisher_tx);
        self.cancel = Some(cancel_tx);
        self.state = TranslatorState::Running;
        info!("Translator running");
        Ok(())
    }

    /// Stop all pollers, tear down driver instances and close the transport.
    ///
    /// Every timer of the old generation is fully stopped before this
    /// returns, so a following [`start`](Self::start) can never interleave
    /// with stale pollers.
    pub async fn stop(&mut self, reason: ShutdownReason) {
        if self.state == TranslatorState::Stopped {
            return;
        }
        self.state = match reason {
            ShutdownReason::ConfigReload => TranslatorState::Reloading,
            ShutdownReason::Signal => TranslatorState::Stopped,
        };
        info!(?reason, "Stopping translator");

        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        if let Some(tx) = self.publisher_tx.take() {
            let _ = tx.send(PublisherCommand::Stop).await;
        }
        if let Some(task) = self.publisher_task.take() {
            let _ = task.await;
        }

        self.state = TranslatorState::Stopped;
        info!("Stop complete");
    }
}

/// Control metrics every device carries in addition to its configured tags.
pub fn device_control_metrics(poll_interval_ms: u64) -> Vec<Metric> {
    vec![
        Metric::new(commands::DEVICE_REBIRTH, DataType::Boolean)
            .with_value(false)
            .with_transient(true),
        Metric::new("Device Control/Polling Interval", DataType::UInt32)
            .with_value(poll_interval_ms)
            .with_transient(true),
    ]
}

/// Resolve a flattened device against its driver.
///
/// Addresses are parsed eagerly here, at config-load time; a tag whose
/// address the driver rejects is dropped from the active set with a warning
/// rather than failing the whole connection.
pub fn prepare_device(driver: &dyn Driver, spec: DeviceSpec) -> (DeviceTable, PolledDevice) {
    let mut metrics = device_control_metrics(spec.poll_interval_ms);
    let mut tags = Vec::new();

    for metric in spec.metrics {
        let address_spec = metric.properties.address.clone().unwrap_or_default();
        match driver.parse_addr(&address_spec) {
            Some(address) => {
                tags.push(PolledTag {
                    metric_index: metrics.len(),
                    address,
                    datatype: metric.datatype,
                    order: metric.properties.endianness.unwrap_or(ByteOrder::Big),
                });
                metrics.push(metric);
            }
            None => {
                warn!(
                    device = %spec.device_id,
                    tag = %metric.name,
                    address = %address_spec,
                    "Dropping tag with invalid address"
                );
            }
        }
    }

    (
        DeviceTable::new(&spec.device_id, spec.payload_format, metrics),
        PolledDevice {
            device_id: spec.device_id,
            tags,
        },
    )
}

/// Decode one raw reading into a metric update.
fn decode_update(tag: &PolledTag, bytes: &[u8]) -> Option<MetricUpdate> {
    let timestamp = current_timestamp_millis();
    match decode_value(bytes, tag.datatype, tag.order) {
        Some(value) => Some(MetricUpdate {
            index: tag.metric_index,
            value,
            timestamp,
        }),
        None => {
            warn!(
                index = tag.metric_index,
                len = bytes.len(),
                "Reading shorter than the declared width"
            );
            None
        }
    }
}

/// Poll every tag of one device strictly sequentially.
pub async fn poll_device_once(driver: &mut dyn Driver, device: &PolledDevice) -> Vec<MetricUpdate> {
    let mut updates = Vec::new();
    for tag in &device.tags {
        let Some(bytes) = driver.poll(&tag.address).await else {
            continue;
        };
        if let Some(update) = decode_update(tag, &bytes) {
            updates.push(update);
        }
    }
    updates
}

/// Drive one connection's poll loop until cancelled.
async fn run_connection(
    runtime: ConnectionRuntime,
    tx: mpsc::Sender<PublisherCommand>,
    mut cancel: watch::Receiver<bool>,
) {
    info!(
        connection = %runtime.name,
        interval_ms = runtime.poll_interval_ms,
        exclusive = runtime.exclusive,
        devices = runtime.devices.len(),
        "Starting poller"
    );

    {
        let mut driver = runtime.driver.lock().await;
        driver.run().await;
    }
    let mut last_status = {
        let driver = runtime.driver.lock().await;
        driver.status()
    };
    let _ = tx
        .send(PublisherCommand::ConnectionStatus {
            connection: runtime.name.clone(),
            status: last_status,
        })
        .await;

    let mut interval = tokio::time::interval(Duration::from_millis(runtime.poll_interval_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            _ = interval.tick() => {}
        }

        if runtime.exclusive {
            // A shared physical bus: no two polls may overlap, so the
            // driver stays locked for the whole tick.
            let mut driver = runtime.driver.lock().await;
            for device in &runtime.devices {
                let updates = poll_device_once(driver.as_mut(), device).await;
                if !updates.is_empty() {
                    let command = PublisherCommand::DeviceData {
                        device_id: device.device_id.clone(),
                        updates,
                    };
                    if tx.send(command).await.is_err() {
                        return;
                    }
                }
            }
        } else {
            let polls = runtime.devices.iter().map(|device| {
                let driver = runtime.driver.clone();
                async move {
                    let mut updates = Vec::new();
                    for tag in &device.tags {
                        let bytes = {
                            let mut driver = driver.lock().await;
                            driver.poll(&tag.address).await
                        };
                        if let Some(bytes) = bytes
                            && let Some(update) = decode_update(tag, &bytes)
                        {
                            updates.push(update);
                        }
                    }
                    (device.device_id.clone(), updates)
                }
            });

            for (device_id, updates) in futures::future::join_all(polls).await {
                if !updates.is_empty()
                    && tx
                        .send(PublisherCommand::DeviceData { device_id, updates })
                        .await
                        .is_err()
                {
                    return;
                }
            }
        }

        let status = {
            let driver = runtime.driver.lock().await;
            driver.status()
        };
        if status != last_status {
            info!(
                connection = %runtime.name,
                from = %last_status,
                to = %status,
                "Connection status changed"
            );
            let _ = tx
                .send(PublisherCommand::ConnectionStatus {
                    connection: runtime.name.clone(),
                    status,
                })
                .await;

            // A recovered link re-announces its devices; a lost one marks
            // them dead so consumers stop trusting stale values.
            for device in &runtime.devices {
                let command = match (last_status, status) {
                    (_, ConnectionStatus::Up) => PublisherCommand::DeviceBirth {
                        device_id: device.device_id.clone(),
                    },
                    (ConnectionStatus::Up, _) => PublisherCommand::DeviceDeath {
                        device_id: device.device_id.clone(),
                    },
                    _ => continue,
                };
                let _ = tx.send(command).await;
            }
            last_status = status;
        }
    }

    info!(connection = %runtime.name, "Poller stopped");
}
