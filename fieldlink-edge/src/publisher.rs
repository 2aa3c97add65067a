//! Bus publisher: alias assignment, birth/data/death messages and command
//! handling for one node and its devices.

use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fieldlink_common::metric::{
    DataType, Metric, MetricValue, current_timestamp_millis,
};
use fieldlink_common::serialization::{Format, decode_auto, encode};
use fieldlink_common::sparkplug::{MessageKind, Payload, PayloadMetric, Topic, commands};
use fieldlink_common::transport::{Transport, TransportEvent};

use crate::driver::ConnectionStatus;
use crate::translator::NodeIdentity;

/// One value update produced by a poll, addressed by position in the
/// device's metric table.
#[derive(Debug, Clone)]
pub struct MetricUpdate {
    pub index: usize,
    pub value: MetricValue,
    pub timestamp: i64,
}

/// Commands from the translator's poll tasks to the publisher.
#[derive(Debug)]
pub enum PublisherCommand {
    /// One poll tick's worth of updates for a device, flushed as a single
    /// data message.
    DeviceData {
        device_id: String,
        updates: Vec<MetricUpdate>,
    },
    /// Announce (or re-announce) a device.
    DeviceBirth { device_id: String },
    /// Mark a device dead on the bus.
    DeviceDeath { device_id: String },
    /// A driver's connection status changed.
    ConnectionStatus {
        connection: String,
        status: ConnectionStatus,
    },
    /// Stop publishing and disconnect cleanly.
    Stop,
}

/// Per-device publication state.
#[derive(Debug)]
pub struct DeviceTable {
    pub device_id: String,
    pub format: Format,
    pub metrics: Vec<Metric>,
    born: bool,
}

impl DeviceTable {
    pub fn new(device_id: impl Into<String>, format: Format, metrics: Vec<Metric>) -> Self {
        Self {
            device_id: device_id.into(),
            format,
            metrics,
            born: false,
        }
    }
}

/// Assign aliases in ascending discovery order, node metrics first.
///
/// Runs at every full birth cycle; aliases are scoped to the session and
/// carry no meaning across reconnects.
fn assign_aliases(node_metrics: &mut [Metric], devices: &mut [DeviceTable]) -> u64 {
    let mut counter = 0;
    for metric in node_metrics.iter_mut() {
        metric.alias = Some(counter);
        counter += 1;
    }
    for device in devices.iter_mut() {
        for metric in &mut device.metrics {
            metric.alias = Some(counter);
            counter += 1;
        }
    }
    counter
}

fn birth_payload(metrics: &[Metric], timestamp: i64) -> Payload {
    Payload::new(timestamp, metrics.iter().map(PayloadMetric::birth).collect())
}

fn data_payload(metrics: &[Metric], changed: &[usize], timestamp: i64) -> Payload {
    Payload::new(
        timestamp,
        changed
            .iter()
            .filter_map(|&i| metrics.get(i).map(PayloadMetric::data))
            .collect(),
    )
}

fn is_set(metric: &PayloadMetric) -> bool {
    matches!(metric.value, Some(MetricValue::Bool(true)))
}

/// One turn of the publisher's event loop.
enum Step {
    Command(PublisherCommand),
    Event(TransportEvent),
    Closed,
}

/// The publishing half of the translator.
///
/// Owns the transport and all metric state; poll tasks only send value
/// updates. Births are re-emitted before any data whenever the session is
/// re-established.
pub struct SparkplugPublisher {
    identity: NodeIdentity,
    transport: Transport,
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<PublisherCommand>,
    reload_tx: mpsc::Sender<()>,
    node_metrics: Vec<Metric>,
    node_format: Format,
    devices: Vec<DeviceTable>,
    alias_counter: u64,
    online: bool,
}

impl SparkplugPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: NodeIdentity,
        transport: Transport,
        events: mpsc::Receiver<TransportEvent>,
        commands: mpsc::Receiver<PublisherCommand>,
        reload_tx: mpsc::Sender<()>,
        config_revision: Option<String>,
        connections: &[String],
        devices: Vec<DeviceTable>,
    ) -> Self {
        let mut node_metrics = vec![
            Metric::new("Node Control/Rebirth", DataType::Boolean)
                .with_value(false)
                .with_transient(true),
            Metric::new("Node Control/Reload Config", DataType::Boolean)
                .with_value(false)
                .with_transient(true),
            Metric::new("Config Revision", DataType::Text)
                .with_value(config_revision.unwrap_or_default().as_str()),
        ];
        for connection in connections {
            node_metrics.push(
                Metric::new(format!("Connections/{}/Status", connection), DataType::Text)
                    .with_value(ConnectionStatus::Down.as_str())
                    .with_transient(true),
            );
        }

        Self {
            identity,
            transport,
            events,
            commands,
            reload_tx,
            node_metrics,
            node_format: Format::Json,
            devices,
            alias_counter: 0,
            online: false,
        }
    }

    /// Run until a `Stop` command arrives, then disconnect cleanly.
    pub async fn run(mut self) {
        loop {
            let step = tokio::select! {
                command = self.commands.recv() => command.map(Step::Command).unwrap_or(Step::Closed),
                event = self.events.recv() => event.map(Step::Event).unwrap_or(Step::Closed),
            };

            match step {
                Step::Command(PublisherCommand::Stop) | Step::Closed => break,
                Step::Command(command) => self.handle_command(command).await,
                Step::Event(event) => self.handle_event(event).await,
            }
        }

        self.transport.disconnect().await;
        info!("Publisher stopped");
    }

    async fn handle_command(&mut self, command: PublisherCommand) {
        match command {
            PublisherCommand::DeviceData { device_id, updates } => {
                self.handle_data(&device_id, updates).await;
            }
            PublisherCommand::DeviceBirth { device_id } => {
                if let Some(index) = self.device_index(&device_id) {
                    self.publish_dbirth(index).await;
                }
            }
            PublisherCommand::DeviceDeath { device_id } => {
                self.publish_ddeath(&device_id).await;
            }
            PublisherCommand::ConnectionStatus { connection, status } => {
                self.update_connection_status(&connection, status).await;
            }
            PublisherCommand::Stop => {}
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                info!("Connected to broker");
                self.online = true;
                self.subscribe_commands().await;
                self.publish_births().await;
            }
            TransportEvent::Disconnected => {
                warn!("Lost broker connection");
                self.online = false;
            }
            TransportEvent::Message { topic, payload } => {
                self.handle_message(&topic, &payload).await;
            }
        }
    }

    async fn subscribe_commands(&self) {
        let ncmd = Topic::node(
            &self.identity.namespace,
            &self.identity.group,
            MessageKind::NCmd,
            &self.identity.node,
        )
        .to_string();
        let dcmd = format!(
            "{}/{}/DCMD/{}/+",
            self.identity.namespace, self.identity.group, self.identity.node
        );

        for filter in [ncmd, dcmd] {
            if let Err(e) = self.transport.subscribe(&filter, QoS::AtLeastOnce).await {
                warn!(filter = %filter, error = %e, "Command subscription failed");
            }
        }
    }

    async fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        let Some(topic) = Topic::parse(topic) else {
            warn!(topic, "Ignoring message on unparseable topic");
            return;
        };
        if topic.group != self.identity.group || topic.node != self.identity.node {
            return;
        }

        let payload: Payload = match decode_auto(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping malformed command payload");
                return;
            }
        };

        match topic.kind {
            MessageKind::NCmd => self.handle_ncmd(&payload).await,
            MessageKind::DCmd => {
                if let Some(device_id) = topic.device.clone() {
                    self.handle_dcmd(&device_id, &payload).await;
                }
            }
            _ => {}
        }
    }

    async fn handle_ncmd(&mut self, payload: &Payload) {
        for metric in &payload.metrics {
            let name = resolve_command_name(metric, &self.node_metrics);
            match name.as_deref() {
                Some(commands::NODE_REBIRTH) if is_set(metric) => {
                    info!("Node rebirth requested");
                    self.publish_births().await;
                }
                Some(commands::NODE_RELOAD_CONFIG) if is_set(metric) => {
                    info!("Configuration reload requested over the bus");
                    let _ = self.reload_tx.send(()).await;
                }
                Some(name) => debug!(name, "Unhandled node command"),
                None => debug!("Node command with unresolvable alias"),
            }
        }
    }

    async fn handle_dcmd(&mut self, device_id: &str, payload: &Payload) {
        let Some(index) = self.device_index(device_id) else {
            warn!(device_id, "Device command for unknown device");
            return;
        };

        let mut rebirth = false;
        for metric in &payload.metrics {
            let name = resolve_command_name(metric, &self.devices[index].metrics);
            match name.as_deref() {
                Some(commands::DEVICE_REBIRTH) if is_set(metric) => rebirth = true,
                Some(name) => debug!(device_id, name, "Unhandled device command"),
                None => debug!(device_id, "Device command with unresolvable alias"),
            }
        }
        if rebirth {
            info!(device_id, "Device rebirth requested");
            self.publish_dbirth(index).await;
        }
    }

    fn device_index(&self, device_id: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.device_id == device_id)
    }

    /// Re-announce everything: NBIRTH first, then one DBIRTH per device.
    async fn publish_births(&mut self) {
        if !self.online {
            debug!("Deferring births until the session is up");
            return;
        }

        self.alias_counter = assign_aliases(&mut self.node_metrics, &mut self.devices);

        let now = current_timestamp_millis();
        let payload = birth_payload(&self.node_metrics, now);
        let topic = Topic::node(
            &self.identity.namespace,
            &self.identity.group,
            MessageKind::NBirth,
            &self.identity.node,
        );
        self.publish(&topic, &payload, self.node_format, QoS::AtLeastOnce)
            .await;
        info!(node = %self.identity.node, "NBIRTH published");

        for index in 0..self.devices.len() {
            self.publish_dbirth(index).await;
        }
    }

    async fn publish_dbirth(&mut self, index: usize) {
        if !self.online {
            debug!("Deferring device birth until the session is up");
            return;
        }

        // Metrics that missed the last full cycle join at the tail so
        // already-announced aliases stay stable within the session.
        for metric in &mut self.devices[index].metrics {
            if metric.alias.is_none() {
                metric.alias = Some(self.alias_counter);
                self.alias_counter += 1;
            }
        }

        let device = &self.devices[index];
        let now = current_timestamp_millis();
        let payload = birth_payload(&device.metrics, now);
        let topic = Topic::device(
            &self.identity.namespace,
            &self.identity.group,
            MessageKind::DBirth,
            &self.identity.node,
            &device.device_id,
        );
        let format = device.format;
        self.publish(&topic, &payload, format, QoS::AtLeastOnce).await;
        info!(device = %self.devices[index].device_id, "DBIRTH published");
        self.devices[index].born = true;
    }

    async fn publish_ddeath(&mut self, device_id: &str) {
        let Some(index) = self.device_index(device_id) else {
            return;
        };
        if !self.devices[index].born {
            return;
        }
        self.devices[index].born = false;

        if !self.online {
            return;
        }
        let now = current_timestamp_millis();
        let payload = Payload::new(now, Vec::new());
        let topic = Topic::device(
            &self.identity.namespace,
            &self.identity.group,
            MessageKind::DDeath,
            &self.identity.node,
            device_id,
        );
        let format = self.devices[index].format;
        self.publish(&topic, &payload, format, QoS::AtLeastOnce).await;
        info!(device = %device_id, "DDEATH published");
    }

    async fn handle_data(&mut self, device_id: &str, updates: Vec<MetricUpdate>) {
        let Some(index) = self.device_index(device_id) else {
            warn!(device_id, "Data for unknown device");
            return;
        };

        let mut changed = Vec::new();
        for update in updates {
            let Some(metric) = self.devices[index].metrics.get_mut(update.index) else {
                continue;
            };
            if metric.set_value(update.value, update.timestamp) {
                changed.push(update.index);
            }
        }
        if changed.is_empty() {
            return;
        }

        // A device that has not announced yet gets a birth instead; the
        // birth carries the current values.
        if !self.devices[index].born {
            self.publish_dbirth(index).await;
            return;
        }
        if !self.online {
            return;
        }

        let device = &self.devices[index];
        let payload = data_payload(&device.metrics, &changed, current_timestamp_millis());
        let topic = Topic::device(
            &self.identity.namespace,
            &self.identity.group,
            MessageKind::DData,
            &self.identity.node,
            &device.device_id,
        );
        let format = device.format;
        self.publish(&topic, &payload, format, QoS::AtMostOnce).await;
    }

    async fn update_connection_status(&mut self, connection: &str, status: ConnectionStatus) {
        let name = format!("Connections/{}/Status", connection);
        let now = current_timestamp_millis();

        let Some(position) = self.node_metrics.iter().position(|m| m.name == name) else {
            return;
        };
        let changed = self.node_metrics[position]
            .set_value(MetricValue::Text(status.as_str().to_string()), now);
        if !changed || !self.online {
            return;
        }

        let payload = data_payload(&self.node_metrics, &[position], now);
        let topic = Topic::node(
            &self.identity.namespace,
            &self.identity.group,
            MessageKind::NData,
            &self.identity.node,
        );
        self.publish(&topic, &payload, self.node_format, QoS::AtMostOnce)
            .await;
    }

    async fn publish(&self, topic: &Topic, payload: &Payload, format: Format, qos: QoS) {
        match encode(payload, format) {
            Ok(bytes) => {
                if let Err(e) = self.transport.publish(&topic.to_string(), bytes, qos).await {
                    warn!(topic = %topic, error = %e, "Publish failed");
                }
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Payload encoding failed");
            }
        }
    }
}

/// Resolve a command metric to a name, falling back to the alias table of
/// the current session when only an alias was sent.
fn resolve_command_name(metric: &PayloadMetric, table: &[Metric]) -> Option<String> {
    if let Some(name) = &metric.name {
        return Some(name.clone());
    }
    let alias = metric.alias?;
    table
        .iter()
        .find(|m| m.alias == Some(alias))
        .map(|m| m.name.clone())
}
