//! In-process broker.
//!
//! A [`MemoryBroker`] routes messages between any number of attached
//! [`MemoryTransport`]s with the same semantics the protocol relies on from
//! a real broker: wildcard filters, retained messages replayed at subscribe
//! time, and `$queue/` shared subscriptions where each message goes to
//! exactly one group member (round-robin).
//!
//! This is what the test suite runs against, and it doubles as a transport
//! for single-process embeddings. It also scripts connection loss:
//! [`MemoryBroker::interrupt_all`] drops every client and clears its
//! subscriptions (clean-session), [`MemoryBroker::restore_all`] brings them
//! back, so reconnect behavior is testable without a network.

use super::{
    ConnectionState, InboundMessage, OutboundMessage, Transport, TransportError, TransportEvent,
};
use crate::topic::{topic_matches, SHARED_PREFIX};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Client {
    events_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    subscriptions: Vec<String>,
}

#[derive(Default)]
struct BrokerState {
    next_id: usize,
    clients: HashMap<usize, Client>,
    retained: HashMap<String, OutboundMessage>,
    /// Round-robin cursor per shared-subscription group.
    group_cursors: HashMap<String, usize>,
}

/// An in-process message broker.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new client. The returned channel already carries the
    /// initial `Connected` event.
    pub async fn attach(self: &Arc<Self>) -> (Arc<MemoryTransport>, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.clients.insert(
                id,
                Client {
                    events_tx: events_tx.clone(),
                    connected: connected.clone(),
                    subscriptions: Vec::new(),
                },
            );
            id
        };

        let _ = events_tx.send(TransportEvent::Connected).await;

        let transport = Arc::new(MemoryTransport {
            broker: self.clone(),
            id,
            connected,
        });
        (transport, events_rx)
    }

    /// Drop every client connection: subscriptions are cleared (the broker
    /// keeps no session state) and each client observes `Disconnected`.
    pub async fn interrupt_all(&self) {
        let senders: Vec<_> = {
            let mut state = self.state.lock();
            state
                .clients
                .values_mut()
                .map(|client| {
                    client.connected.store(false, Ordering::SeqCst);
                    client.subscriptions.clear();
                    client.events_tx.clone()
                })
                .collect()
        };
        for tx in senders {
            let _ = tx.send(TransportEvent::Disconnected).await;
        }
    }

    /// Re-establish every client connection; each observes `Connected` and
    /// is expected to resubscribe.
    pub async fn restore_all(&self) {
        let senders: Vec<_> = {
            let mut state = self.state.lock();
            state
                .clients
                .values_mut()
                .map(|client| {
                    client.connected.store(true, Ordering::SeqCst);
                    client.events_tx.clone()
                })
                .collect()
        };
        for tx in senders {
            let _ = tx.send(TransportEvent::Connected).await;
        }
    }

    /// Number of active subscriptions across all clients.
    pub fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .clients
            .values()
            .map(|c| c.subscriptions.len())
            .sum()
    }

    async fn route(&self, message: OutboundMessage) {
        let targets = {
            let mut state = self.state.lock();

            if message.retain {
                state.retained.insert(message.topic.clone(), message.clone());
            }

            // Broadcast subscribers get at most one copy each, whatever the
            // number of overlapping filters. Shared groups get one copy per
            // group, handed to the member picked by the group cursor.
            let mut broadcast: Vec<usize> = Vec::new();
            let mut groups: HashMap<String, Vec<usize>> = HashMap::new();

            for (id, client) in &state.clients {
                if !client.connected.load(Ordering::SeqCst) {
                    continue;
                }
                for filter in &client.subscriptions {
                    if let Some(shared) = filter.strip_prefix(SHARED_PREFIX) {
                        if topic_matches(shared, &message.topic) {
                            groups.entry(filter.clone()).or_default().push(*id);
                        }
                    } else if topic_matches(filter, &message.topic) && !broadcast.contains(id) {
                        broadcast.push(*id);
                    }
                }
            }

            let mut chosen = broadcast;
            for (group, mut members) in groups {
                members.sort_unstable();
                members.dedup();
                let cursor = state.group_cursors.entry(group).or_insert(0);
                let member = members[*cursor % members.len()];
                *cursor += 1;
                if !chosen.contains(&member) {
                    chosen.push(member);
                }
            }

            chosen
                .into_iter()
                .filter_map(|id| state.clients.get(&id).map(|c| c.events_tx.clone()))
                .collect::<Vec<_>>()
        };

        debug!(topic = %message.topic, receivers = targets.len(), "Routing message");
        let inbound = InboundMessage::from_outbound(&message);
        for tx in targets {
            let _ = tx.send(TransportEvent::Message(inbound.clone())).await;
        }
    }

    async fn add_subscription(&self, id: usize, filter: &str) {
        let replay: Vec<(mpsc::Sender<TransportEvent>, InboundMessage)> = {
            let mut state = self.state.lock();
            let Some(client) = state.clients.get_mut(&id) else {
                return;
            };
            if !client.subscriptions.iter().any(|f| f == filter) {
                client.subscriptions.push(filter.to_string());
            }
            let events_tx = client.events_tx.clone();

            // Retained messages matching the new filter are replayed to the
            // subscriber immediately.
            let plain = filter.strip_prefix(SHARED_PREFIX).unwrap_or(filter);
            state
                .retained
                .values()
                .filter(|m| topic_matches(plain, &m.topic))
                .map(|m| (events_tx.clone(), InboundMessage::from_outbound(m)))
                .collect()
        };

        for (tx, inbound) in replay {
            let _ = tx.send(TransportEvent::Message(inbound)).await;
        }
    }

    fn detach(&self, id: usize) {
        self.state.lock().clients.remove(&id);
    }
}

/// One client connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    id: usize,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.broker.route(message).await;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.broker.add_subscription(self.id, filter).await;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn force_reconnect(&self) {
        let (events_tx, connected) = {
            let mut state = self.broker.state.lock();
            let Some(client) = state.clients.get_mut(&self.id) else {
                return;
            };
            client.subscriptions.clear();
            (client.events_tx.clone(), client.connected.clone())
        };
        connected.store(false, Ordering::SeqCst);
        let _ = events_tx.send(TransportEvent::Disconnected).await;
        connected.store(true, Ordering::SeqCst);
        let _ = events_tx.send(TransportEvent::Connected).await;
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.broker.detach(self.id);
    }
}
