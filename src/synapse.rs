//! The Synapse facade.
//!
//! The host builds a [`SynapseBuilder`], registers its handlers, and calls
//! [`SynapseBuilder::connect`]. That validates the identity, opens the broker
//! connection and spawns the inbound dispatcher. The resulting [`Synapse`]
//! handle is cheap to clone and exposes the three call surfaces: fire event,
//! call RPC, get/set config.
//!
//! # Inbound dispatch
//!
//! ```text
//!                     ┌───────────────────────────────┐
//!  transport events ─▶│          DISPATCHER           │
//!                     │                               │
//!                     │  Connected    -> resubscribe  │
//!                     │  {rpc reply}  -> rpc::client  │
//!                     │  {rpc server} -> rpc::server  │
//!                     │  {config}     -> store        │
//!                     │  {event}      -> event bus    │
//!                     └───────────────────────────────┘
//! ```
//!
//! All inbound messages arrive serialized through one channel; fan-out (one
//! task per event handler, one per RPC request) happens behind it. The full
//! subscription set is re-issued on every `Connected`, so a reconnect
//! restores every subscription without host involvement.

use crate::config::{ConfigError, SynapseConfig};
use crate::event::{self, EventError};
use crate::registry::{HandlerError, HandlerRegistry, RpcError};
use crate::rpc::{self, RpcCallError, SynapseResponse};
use crate::shutdown::ShutdownSignal;
use crate::store::{self, ConfigEntry, StoreError};
use crate::topic::TopicScheme;
use crate::transport::{
    ConnectionState, InboundMessage, MqttTransport, Transport, TransportError, TransportEvent,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors that can prevent a Synapse instance from starting.
#[derive(Debug, Error)]
pub enum SynapseError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Shared state behind a [`Synapse`] handle.
pub(crate) struct SynapseInner {
    pub(crate) config: SynapseConfig,
    pub(crate) app_id: String,
    pub(crate) topics: TopicScheme,
    pub(crate) registry: HandlerRegistry,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
    pub(crate) store: store::ConfigCache,
    subscriptions: Vec<String>,
    shutdown: ShutdownSignal,
}

/// Collects configuration and handler registrations, then connects.
///
/// Invalid registrations are logged and skipped; startup continues without
/// them. A duplicate RPC key keeps the first registration.
pub struct SynapseBuilder {
    config: SynapseConfig,
    registry: HandlerRegistry,
}

impl SynapseBuilder {
    pub fn new(config: SynapseConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
        }
    }

    /// Register an event handler for `key`, which may contain `+` and `#`
    /// wildcard segments. The handler receives the raw event payload.
    pub fn register_event<F, Fut>(&mut self, key: &str, handler: F) -> &mut Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.registry.register_event(key, handler);
        self
    }

    /// Register an event handler receiving the payload and the message's
    /// header map.
    pub fn register_event_with_headers<F, Fut>(&mut self, key: &str, handler: F) -> &mut Self
    where
        F: Fn(String, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.registry.register_event_with_headers(key, handler);
        self
    }

    /// Register an RPC handler for an exact action name. The handler
    /// receives the raw request payload string.
    pub fn register_rpc<F, Fut>(&mut self, key: &str, handler: F) -> &mut Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.registry.register_rpc(key, handler);
        self
    }

    /// Register an RPC handler that takes no payload.
    pub fn register_rpc_no_param<F, Fut>(&mut self, key: &str, handler: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.registry.register_rpc_no_param(key, handler);
        self
    }

    /// Register a typed RPC handler: the payload is deserialized into `P`,
    /// the returned `R` becomes the response's `data`.
    pub fn register_rpc_json<P, R, F, Fut>(&mut self, key: &str, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        self.registry.register_rpc_json(key, handler);
        self
    }

    /// Validate, open the broker connection and start dispatching.
    pub async fn connect(self) -> Result<Synapse, SynapseError> {
        let app_id = resolve_app_id(&self.config);
        let (transport, events) = MqttTransport::connect(&self.config, &app_id)?;
        self.start(transport, events, app_id)
    }

    /// Like [`connect`](Self::connect), but over a caller-supplied
    /// transport. Used with [`MemoryBroker`](crate::transport::MemoryBroker)
    /// in tests and single-process embeddings.
    pub async fn connect_with(
        self,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Result<Synapse, SynapseError> {
        let app_id = resolve_app_id(&self.config);
        self.start(transport, events, app_id)
    }

    fn start(
        self,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        app_id: String,
    ) -> Result<Synapse, SynapseError> {
        if let Err(err) = self.config.validate() {
            error!(error = %err, "Synapse initialization failed");
            return Err(err.into());
        }

        let config = self.config;
        let registry = self.registry;
        let topics = TopicScheme::new(&config.sys_name, &config.app_name, &app_id);

        info!(
            sys_name = %config.sys_name,
            app_name = %config.app_name,
            app_id = %app_id,
            "Synapse starting"
        );
        if registry.has_event_handlers() {
            info!(keys = ?registry.event_keys(), "Registered event handlers");
        }
        if registry.has_rpc_handlers() {
            info!(keys = ?registry.rpc_keys(), "Registered rpc handlers");
        }

        let subscriptions = build_subscriptions(&config, &registry, &topics);

        if config.disable_event_client {
            warn!("Event client disabled by configuration");
        } else {
            info!("Event client ready");
        }
        if config.disable_rpc_client {
            warn!("Rpc client disabled by configuration");
        } else {
            info!(
                timeout_secs = config.rpc_timeout_secs,
                "Rpc client ready"
            );
        }
        if registry.has_rpc_handlers() {
            info!("Rpc server ready");
        }
        if config.enable_config_store {
            info!("Config store ready");
        }

        let inner = Arc::new(SynapseInner {
            config,
            app_id,
            topics,
            registry,
            transport,
            pending: Mutex::new(HashMap::new()),
            store: store::ConfigCache::new(),
            subscriptions,
            shutdown: ShutdownSignal::new(),
        });

        tokio::spawn(run_dispatcher(inner.clone(), events));

        Ok(Synapse { inner })
    }
}

/// A connected Synapse instance. Clones share the same connection.
#[derive(Clone)]
pub struct Synapse {
    inner: Arc<SynapseInner>,
}

impl Synapse {
    pub fn builder(config: SynapseConfig) -> SynapseBuilder {
        SynapseBuilder::new(config)
    }

    /// Fire an event under this application's name.
    ///
    /// String payloads are published verbatim, everything else is
    /// JSON-encoded. Returns `Ok(false)` when the event was dropped because
    /// the transport is not connected or the event client is disabled.
    pub async fn fire_event<P: Serialize>(
        &self,
        event_name: &str,
        param: &P,
    ) -> Result<bool, EventError> {
        self.fire_event_with_headers(event_name, param, Vec::new())
            .await
    }

    /// Fire an event with application headers attached.
    pub async fn fire_event_with_headers<P: Serialize>(
        &self,
        event_name: &str,
        param: &P,
        headers: Vec<(String, String)>,
    ) -> Result<bool, EventError> {
        if self.inner.config.disable_event_client {
            error!("Event client disabled, event not fired");
            return Ok(false);
        }
        let payload = encode_param(param)?;
        event::fire(&self.inner, event_name, payload, headers).await
    }

    /// Call `method` on application `app` and decode the response data
    /// into `T`.
    ///
    /// Remote failures arrive as a response with a non-200 code; an `Err`
    /// here means the call never produced a response envelope at all.
    pub async fn rpc<T, P>(
        &self,
        app: &str,
        method: &str,
        param: &P,
    ) -> Result<SynapseResponse<T>, RpcCallError>
    where
        T: DeserializeOwned,
        P: Serialize,
    {
        self.rpc_with_headers(app, method, param, Vec::new()).await
    }

    /// Like [`rpc`](Self::rpc), with application headers attached to the
    /// request.
    pub async fn rpc_with_headers<T, P>(
        &self,
        app: &str,
        method: &str,
        param: &P,
        headers: Vec<(String, String)>,
    ) -> Result<SynapseResponse<T>, RpcCallError>
    where
        T: DeserializeOwned,
        P: Serialize,
    {
        if self.inner.config.disable_rpc_client {
            error!("Rpc client disabled, call rejected");
            return Err(RpcCallError::Disabled);
        }
        let payload = encode_param(param).map_err(RpcCallError::Encode)?;
        let raw = rpc::client::fire_rpc(&self.inner, app, method, payload, headers).await?;
        serde_json::from_str(&raw).map_err(RpcCallError::Decode)
    }

    /// Publish a retained configuration entry. See
    /// [`store`](crate::store) for key rules.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        store::set(&self.inner, key, value).await
    }

    /// Read a configuration entry from the local view.
    pub fn get_config(&self, key: &str) -> Option<String> {
        self.inner.store.get(key)
    }

    /// Subscribe to configuration change notifications.
    pub fn config_changes(&self) -> tokio::sync::broadcast::Receiver<ConfigEntry> {
        self.inner.store.subscribe_changes()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn app_id(&self) -> &str {
        &self.inner.app_id
    }

    /// Stop dispatching and close the broker connection.
    pub async fn close(&self) {
        self.inner.shutdown.trigger();
        self.inner.transport.close().await;
    }

    /// Block until the process receives a termination signal, then close.
    pub async fn run_until_shutdown(&self) {
        self.inner.shutdown.wait().await;
        self.inner.transport.close().await;
    }

    #[cfg(test)]
    pub(crate) fn pending_call_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

fn resolve_app_id(config: &SynapseConfig) -> String {
    config
        .app_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Serialize an outbound parameter: strings pass through verbatim,
/// everything else is JSON-encoded.
fn encode_param<P: Serialize>(param: &P) -> Result<String, serde_json::Error> {
    match serde_json::to_value(param)? {
        Value::String(s) => Ok(s),
        other => serde_json::to_string(&other),
    }
}

/// The full subscription set of this instance, re-issued on every connect.
fn build_subscriptions(
    config: &SynapseConfig,
    registry: &HandlerRegistry,
    topics: &TopicScheme,
) -> Vec<String> {
    let mut subscriptions = Vec::new();

    for key in registry.event_keys() {
        subscriptions.push(topics.event_subscription(key, config.event_load_balancing));
    }
    if !config.disable_rpc_client {
        subscriptions.push(topics.rpc_reply_subscription());
    }
    if registry.has_rpc_handlers() {
        subscriptions.push(topics.rpc_server_subscription());
    }
    if config.enable_config_store {
        subscriptions.push(topics.config_subscription());
    }

    subscriptions
}

/// The inbound dispatcher: one task per instance, stopped by the shutdown
/// signal or by the transport going away.
async fn run_dispatcher(inner: Arc<SynapseInner>, mut events: mpsc::Receiver<TransportEvent>) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                break;
            }
            event = events.recv() => {
                match event {
                    None => break,
                    Some(TransportEvent::Connected) => resubscribe(&inner).await,
                    Some(TransportEvent::Disconnected) => {
                        warn!("Broker connection lost");
                    }
                    Some(TransportEvent::Message(message)) => route(&inner, message),
                }
            }
        }
    }
    debug!("Dispatcher stopped");
}

/// (Re)issue every subscription. Runs after each connect, including the
/// first; a failure halfway leaves the process partially subscribed, so it
/// forces a full reconnect instead of carrying on.
async fn resubscribe(inner: &Arc<SynapseInner>) {
    for filter in &inner.subscriptions {
        match inner.transport.subscribe(filter).await {
            Ok(()) => debug!(filter = %filter, "Subscription active"),
            Err(err) => {
                error!(
                    filter = %filter,
                    error = %err,
                    "Subscription failed, forcing reconnect"
                );
                inner.transport.force_reconnect().await;
                return;
            }
        }
    }
    info!(count = inner.subscriptions.len(), "Subscriptions established");
}

/// Route one inbound message to its owning module by topic prefix.
fn route(inner: &Arc<SynapseInner>, message: InboundMessage) {
    let topic = message.topic.clone();

    if let Some(call_id) = topic.strip_prefix(inner.topics.rpc_reply_prefix()) {
        rpc::client::resolve_response(inner, call_id, message.payload);
    } else if let Some(action) = topic.strip_prefix(inner.topics.rpc_server_prefix()) {
        rpc::server::spawn_handle(inner.clone(), action.to_string(), message);
    } else if let Some(key) = topic.strip_prefix(inner.topics.config_prefix()) {
        store::apply(inner, key, message.payload);
    } else if let Some(event_name) = topic.strip_prefix(inner.topics.event_prefix()) {
        event::dispatch(inner, event_name, message);
    } else {
        debug!(topic = %topic, "Inbound message matched no module, ignoring");
    }
}
