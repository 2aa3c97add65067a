use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::MqttConfig;
use crate::error::Result;

/// Delay before the event pump retries after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Events surfaced by the transport to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Session established. Emitted on the initial connect and on every
    /// reconnect, so consumers must treat it as a session boundary
    /// (re-announce births, drop cached alias tables).
    Connected,

    /// Session lost. The transport keeps retrying in the background.
    Disconnected,

    /// An inbound publish on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
}

/// MQTT session wrapper.
///
/// Owns the client and a background event pump. The pump forwards session
/// events on a channel and keeps reconnecting until [`Transport::disconnect`]
/// is called. A will message registered at connect time makes an ungraceful
/// disconnect observable to subscribers; a clean disconnect suppresses it.
///
/// Handles are cheap to clone; the first clone to call `disconnect` wins.
#[derive(Clone)]
pub struct Transport {
    client: AsyncClient,
    shutdown: Arc<AtomicBool>,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Transport {
    /// Connect to the broker and start the event pump.
    ///
    /// Returns the transport handle and the event channel. Dropping the
    /// receiver stops the pump.
    pub fn connect(
        config: &MqttConfig,
        client_id: &str,
        will: Option<(String, Vec<u8>)>,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        if let Some((topic, payload)) = will {
            options.set_last_will(LastWill::new(topic, payload, QoS::AtLeastOnce, false));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::channel(256);
        let shutdown = Arc::new(AtomicBool::new(false));

        let pump_shutdown = shutdown.clone();
        let pump = tokio::spawn(async move {
            let mut connected = false;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected = true;
                        if tx.send(TransportEvent::Connected).await.is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let event = TransportEvent::Message {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        if pump_shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if pump_shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        if connected {
                            connected = false;
                            if tx.send(TransportEvent::Disconnected).await.is_err() {
                                break;
                            }
                        }
                        warn!(error = %e, "MQTT connection error, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
            debug!("MQTT event pump stopped");
        });

        (
            Self {
                client,
                shutdown,
                pump: Arc::new(Mutex::new(Some(pump))),
            },
            rx,
        )
    }

    /// Publish a message.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<()> {
        self.client.publish(topic, qos, false, payload).await?;
        Ok(())
    }

    /// Subscribe to a topic filter.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.client.subscribe(filter, qos).await?;
        Ok(())
    }

    /// Disconnect cleanly and stop the event pump.
    ///
    /// A clean DISCONNECT packet suppresses the registered will message.
    /// Safe to call from any clone; later calls are no-ops.
    pub async fn disconnect(&self) {
        let Some(pump) = self.pump.lock().await.take() else {
            return;
        };

        self.shutdown.store(true, Ordering::SeqCst);
        match self.client.disconnect().await {
            // The pump exits once the DISCONNECT packet has gone out
            Ok(()) => {
                let _ = pump.await;
            }
            Err(e) => {
                debug!(error = %e, "Disconnect while already closed");
                pump.abort();
            }
        }
    }
}
