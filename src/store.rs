//! Retained configuration store.
//!
//! Values are published retained under `{sys}/synapse-config-store/{key}`,
//! so the broker replays the last value of every key to anyone who
//! subscribes later. The local view is a flat in-memory map fed by the
//! subscription; reads never touch the broker.

use crate::synapse::SynapseInner;
use crate::transport::{OutboundMessage, TransportError};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Errors surfaced by `set_config`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config store disabled by configuration")]
    Disabled,

    #[error("config key must not contain wildcard characters: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Transport(TransportError),
}

/// One configuration entry, as delivered by change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

/// The local materialized view plus its change-notification channel.
pub(crate) struct ConfigCache {
    entries: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<ConfigEntry>,
}

impl ConfigCache {
    pub(crate) fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    /// Update the local view without raising a change notification; used
    /// for the immediate read-back after a successful local set. The broker
    /// echo that follows is what notifies observers.
    pub(crate) fn set_local(&self, key: &str, value: &str) {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
    }

    pub(crate) fn subscribe_changes(&self) -> broadcast::Receiver<ConfigEntry> {
        self.changes.subscribe()
    }
}

/// Publish one entry, retained.
///
/// Keys may contain path separators (they become nested topics) but never
/// wildcards. Returns `Ok(false)` when not connected; the entry is dropped.
pub(crate) async fn set(
    inner: &SynapseInner,
    key: &str,
    value: &str,
) -> Result<bool, StoreError> {
    if !inner.config.enable_config_store {
        error!("Config store disabled, set_config rejected");
        return Err(StoreError::Disabled);
    }
    if key.contains('+') || key.contains('#') {
        return Err(StoreError::InvalidKey(key.to_string()));
    }

    let message = OutboundMessage::new(inner.topics.config_entry(key), value).retained();
    match inner.transport.publish(message).await {
        Ok(()) => {
            inner.store.set_local(key, value);
            debug!(key, value, "Config set");
            Ok(true)
        }
        Err(TransportError::NotConnected) => Ok(false),
        Err(err) => Err(StoreError::Transport(err)),
    }
}

/// Apply an inbound store message to the local view and notify observers.
///
/// `key` is the inbound topic with the store prefix stripped.
pub(crate) fn apply(inner: &SynapseInner, key: &str, value: String) {
    inner.store.set_local(key, &value);
    debug!(key, value = %value, "Config changed");
    let _ = inner.store.changes.send(ConfigEntry {
        key: key.to_string(),
        value,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SynapseConfig;
    use crate::synapse::Synapse;
    use crate::transport::MemoryBroker;
    use std::time::Duration;

    fn config(app: &str) -> SynapseConfig {
        let mut config = SynapseConfig::new("mem://", "testsys", app);
        config.enable_config_store = true;
        config
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_set_then_get_is_immediate() {
        let broker = MemoryBroker::new();
        let (transport, events) = broker.attach().await;
        let synapse = Synapse::builder(config("app"))
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        assert!(synapse.set_config("x", "1").await.unwrap());
        assert_eq!(synapse.get_config("x").as_deref(), Some("1"));

        synapse.close().await;
    }

    #[tokio::test]
    async fn test_nested_keys_allowed_wildcards_rejected() {
        let broker = MemoryBroker::new();
        let (transport, events) = broker.attach().await;
        let synapse = Synapse::builder(config("app"))
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        assert!(synapse.set_config("a/b", "x").await.unwrap());
        settle().await;
        assert_eq!(synapse.get_config("a/b").as_deref(), Some("x"));

        assert!(matches!(
            synapse.set_config("a/+", "x").await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            synapse.set_config("a/#", "x").await,
            Err(StoreError::InvalidKey(_))
        ));

        synapse.close().await;
    }

    #[tokio::test]
    async fn test_unknown_key_reads_none() {
        let broker = MemoryBroker::new();
        let (transport, events) = broker.attach().await;
        let synapse = Synapse::builder(config("app"))
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        assert!(synapse.get_config("never-set").is_none());
        synapse.close().await;
    }

    #[tokio::test]
    async fn test_changes_propagate_between_instances() {
        let broker = MemoryBroker::new();

        let (transport, events) = broker.attach().await;
        let writer = Synapse::builder(config("writer"))
            .connect_with(transport, events)
            .await
            .unwrap();

        let (transport, events) = broker.attach().await;
        let reader = Synapse::builder(config("reader"))
            .connect_with(transport, events)
            .await
            .unwrap();
        let mut changes = reader.config_changes();
        settle().await;

        writer.set_config("db/url", "postgres://db").await.unwrap();
        settle().await;

        assert_eq!(reader.get_config("db/url").as_deref(), Some("postgres://db"));
        let change = changes.try_recv().unwrap();
        assert_eq!(
            change,
            ConfigEntry {
                key: "db/url".to_string(),
                value: "postgres://db".to_string()
            }
        );

        writer.close().await;
        reader.close().await;
    }

    #[tokio::test]
    async fn test_late_subscriber_seeded_from_retained() {
        let broker = MemoryBroker::new();

        let (transport, events) = broker.attach().await;
        let writer = Synapse::builder(config("writer"))
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;
        writer.set_config("features/beta", "on").await.unwrap();
        settle().await;

        // This instance attaches after the value was set and still sees it.
        let (transport, events) = broker.attach().await;
        let late = Synapse::builder(config("late"))
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        assert_eq!(late.get_config("features/beta").as_deref(), Some("on"));

        writer.close().await;
        late.close().await;
    }

    #[tokio::test]
    async fn test_disabled_store_rejects_set() {
        let broker = MemoryBroker::new();
        let mut config = SynapseConfig::new("mem://", "testsys", "app");
        config.enable_config_store = false;

        let (transport, events) = broker.attach().await;
        let synapse = Synapse::builder(config)
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        assert!(matches!(
            synapse.set_config("x", "1").await,
            Err(StoreError::Disabled)
        ));
        assert!(synapse.get_config("x").is_none());

        synapse.close().await;
    }

    #[tokio::test]
    async fn test_set_when_disconnected_returns_false() {
        let broker = MemoryBroker::new();
        let (transport, events) = broker.attach().await;
        let synapse = Synapse::builder(config("app"))
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        broker.interrupt_all().await;
        settle().await;

        assert!(!synapse.set_config("x", "1").await.unwrap());
        assert!(synapse.get_config("x").is_none());

        synapse.close().await;
    }
}
