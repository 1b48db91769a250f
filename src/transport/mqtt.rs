//! MQTT broker connection.
//!
//! Owns the single rumqttc connection of a Synapse instance. The event loop
//! runs in its own task: a `ConnAck` flips the state to `Connected` and
//! notifies the dispatcher so subscriptions get (re)issued; any connection
//! error flips it to `Disconnected`, waits the configured reconnect delay
//! and tries again, forever. A failed attempt is logged and retried after
//! the same delay.
//!
//! MQTT 5 is required: the RPC reply descriptor travels as the publish's
//! response-topic property, the content type as its content-type property
//! and application headers as user properties.

use super::{
    ConnectionState, InboundMessage, OutboundMessage, Transport, TransportError, TransportEvent,
};
use crate::config::SynapseConfig;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

/// Capacity of the inbound event channel. Inbound handling applies
/// backpressure to the event loop when the dispatcher falls behind.
const EVENT_CHANNEL_CAPACITY: usize = 64;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

/// The rumqttc-backed [`Transport`].
pub struct MqttTransport {
    client: AsyncClient,
    state: Arc<AtomicU8>,
    closed: Arc<AtomicBool>,
}

impl MqttTransport {
    /// Open the broker connection and spawn its event loop.
    ///
    /// Returns immediately; the first `TransportEvent::Connected` arrives on
    /// the returned channel once the broker accepts the session. Connection
    /// failures are retried indefinitely with a fixed delay.
    pub fn connect(
        config: &SynapseConfig,
        app_id: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>), TransportError> {
        let options = broker_options(config, app_id)?;
        let (client, eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);

        let state = Arc::new(AtomicU8::new(STATE_CONNECTING));
        let closed = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let transport = Arc::new(Self {
            client,
            state: state.clone(),
            closed: closed.clone(),
        });

        let reconnect_delay = Duration::from_secs(config.reconnect_delay_secs);
        tokio::spawn(run_event_loop(
            eventloop,
            events_tx,
            state,
            closed,
            reconnect_delay,
        ));

        Ok((transport, events_rx))
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let properties = PublishProperties {
            response_topic: message.response_topic,
            content_type: message.content_type,
            user_properties: message.headers,
            ..PublishProperties::default()
        };

        self.client
            .publish_with_properties(
                message.topic,
                QoS::AtLeastOnce,
                message.retain,
                message.payload,
                properties,
            )
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTED => ConnectionState::Connected,
            STATE_CONNECTING => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        }
    }

    async fn force_reconnect(&self) {
        warn!("Forcing broker reconnect");
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
        let _ = self.client.disconnect().await;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
        let _ = self.client.disconnect().await;
    }
}

/// The connection's event loop: poll, dispatch, reconnect.
async fn run_event_loop(
    mut eventloop: rumqttc::v5::EventLoop,
    events_tx: mpsc::Sender<TransportEvent>,
    state: Arc<AtomicU8>,
    closed: Arc<AtomicBool>,
    reconnect_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                state.store(STATE_CONNECTED, Ordering::SeqCst);
                info!(code = ?ack.code, "Broker connection established");
                if events_tx.send(TransportEvent::Connected).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some(message) = inbound_message(publish) else {
                    continue;
                };
                if events_tx
                    .send(TransportEvent::Message(message))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect(_))) => {
                state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                warn!("Broker sent disconnect");
            }
            Ok(_) => {}
            Err(err) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                if events_tx.send(TransportEvent::Disconnected).await.is_err() {
                    break;
                }
                warn!(
                    error = %err,
                    delay_secs = reconnect_delay.as_secs(),
                    "Broker connection lost, retrying"
                );
                tokio::time::sleep(reconnect_delay).await;
                state.store(STATE_CONNECTING, Ordering::SeqCst);
            }
        }

        if closed.load(Ordering::SeqCst) {
            break;
        }
    }
    debug!("Broker event loop stopped");
}

fn inbound_message(publish: Publish) -> Option<InboundMessage> {
    let topic = match String::from_utf8(publish.topic.to_vec()) {
        Ok(topic) => topic,
        Err(_) => {
            warn!("Dropping inbound message with non-utf8 topic");
            return None;
        }
    };
    let payload = String::from_utf8_lossy(&publish.payload).into_owned();

    let (response_topic, headers) = match publish.properties {
        Some(properties) => (
            properties.response_topic,
            properties.user_properties.into_iter().collect(),
        ),
        None => (None, Default::default()),
    };

    Some(InboundMessage {
        topic,
        payload,
        response_topic,
        headers,
    })
}

/// Build the client options from the configured broker URL.
///
/// The client identity is `{app_name}:{app_id}`, stable across reconnects.
fn broker_options(config: &SynapseConfig, app_id: &str) -> Result<MqttOptions, TransportError> {
    let url = Url::parse(&config.broker_address)
        .map_err(|e| TransportError::Address(e.to_string()))?;
    let client_id = format!("{}:{}", config.app_name, app_id);

    let mut options = match url.scheme() {
        "mqtt" | "tcp" => {
            let host = url
                .host_str()
                .ok_or_else(|| TransportError::Address("missing host".to_string()))?;
            MqttOptions::new(client_id, host, url.port().unwrap_or(1883))
        }
        "ws" => {
            // rumqttc takes the full URL as the broker address for
            // websocket transports.
            let mut options = MqttOptions::new(
                client_id,
                config.broker_address.clone(),
                url.port().unwrap_or(80),
            );
            options.set_transport(rumqttc::Transport::Ws);
            options
        }
        other => return Err(TransportError::UnsupportedScheme(other.to_string())),
    };

    options.set_keep_alive(KEEP_ALIVE);
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    Ok(options)
}
