//! Broker transport.
//!
//! The [`Transport`] trait is the seam between the protocol modules and the
//! wire. One implementation speaks MQTT to a real broker ([`mqtt`]); a second
//! one routes messages through an in-process broker ([`memory`]) and backs
//! the test suite and embedded setups.
//!
//! A transport delivers its inbound side through a channel of
//! [`TransportEvent`]s: one `Connected` per successful (re)connect, one
//! `Message` per inbound publish, `Disconnected` when the link drops. The
//! receiving dispatcher re-issues every subscription on each `Connected`,
//! so subscribing must be idempotent.

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub use memory::{MemoryBroker, MemoryTransport};
pub use mqtt::MqttTransport;

/// Errors reported by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is not currently established. Calls made in this
    /// state are dropped, not queued.
    #[error("not connected to broker")]
    NotConnected,

    #[error("invalid broker address: {0}")]
    Address(String),

    #[error("unsupported broker address scheme: {0}")]
    UnsupportedScheme(String),

    #[error("broker client error: {0}")]
    Client(String),
}

/// State of the logical broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// An outbound publish.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    /// Retained messages are held by the broker and replayed to late
    /// subscribers; only the config store sets this.
    pub retain: bool,
    /// Reply-routing descriptor, carried as MQTT 5 response-topic metadata.
    pub response_topic: Option<String>,
    pub content_type: Option<String>,
    /// Application headers, carried as MQTT 5 user properties.
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
            response_topic: None,
            content_type: None,
            headers: Vec::new(),
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    pub fn with_response_topic(mut self, response_topic: impl Into<String>) -> Self {
        self.response_topic = Some(response_topic.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }
}

/// An inbound publish, as handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub response_topic: Option<String>,
    pub headers: HashMap<String, String>,
}

impl InboundMessage {
    pub(crate) fn from_outbound(message: &OutboundMessage) -> Self {
        Self {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            response_topic: message.response_topic.clone(),
            headers: message.headers.iter().cloned().collect(),
        }
    }
}

/// Events emitted by a transport to its dispatcher.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is established. Sent on every successful connect,
    /// including the first; the receiver re-issues all subscriptions.
    Connected,
    /// The connection dropped; the transport retries on its own.
    Disconnected,
    /// An inbound publish.
    Message(InboundMessage),
}

/// A broker connection.
///
/// Publishing blocks the caller until the transport has handed the message
/// to the broker, and fails fast with [`TransportError::NotConnected`] while
/// the link is down.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Subscribe to a topic filter. Filters starting with `$queue/` are
    /// shared subscriptions. Must be idempotent.
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    fn state(&self) -> ConnectionState;

    /// Tear the connection down so the normal reconnect path re-establishes
    /// it. Used when a resubscription sequence fails halfway.
    async fn force_reconnect(&self);

    /// Permanently close the connection.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_builder() {
        let message = OutboundMessage::new("a/b", "payload")
            .retained()
            .with_response_topic("caller,id,call")
            .with_content_type("application/json")
            .with_headers(vec![("k".to_string(), "v".to_string())]);

        assert_eq!(message.topic, "a/b");
        assert!(message.retain);
        assert_eq!(message.response_topic.as_deref(), Some("caller,id,call"));
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        assert_eq!(message.headers.len(), 1);
    }

    #[test]
    fn test_inbound_from_outbound() {
        let outbound = OutboundMessage::new("a/b", "x")
            .with_headers(vec![("k".to_string(), "v".to_string())]);
        let inbound = InboundMessage::from_outbound(&outbound);
        assert_eq!(inbound.topic, "a/b");
        assert_eq!(inbound.payload, "x");
        assert_eq!(inbound.headers.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }
}
