//! Handler registration and validation.
//!
//! The host registers its handlers explicitly before connecting; there is no
//! runtime scanning. A handler is a closure stored under a key:
//!
//! - event handlers receive the raw payload, or payload plus the message's
//!   header map, and return `Result<(), HandlerError>`;
//! - RPC handlers receive nothing or the raw payload string and return
//!   `Result<Value, RpcError>`, where the `Ok` value becomes the response's
//!   `data` field and the `Err` carries a business code and message.
//!
//! Invalid registrations are logged and skipped; they never abort startup.
//! Event keys are an ordered list matched by wildcard pattern; RPC keys are
//! exact and unique, and a duplicate is rejected rather than overwritten.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors an event handler can surface. They are logged by the dispatcher
/// and never travel back to the publisher.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A business-level RPC failure carrying the numeric code and message that
/// are surfaced verbatim to the remote caller.
#[derive(Debug, Clone, Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: u16,
    pub message: String,
}

impl RpcError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(500, err.to_string())
    }
}

pub(crate) type EventFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
pub(crate) type RpcFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

type EventFn = Arc<dyn Fn(String) -> EventFuture + Send + Sync>;
type EventHeaderFn = Arc<dyn Fn(String, HashMap<String, String>) -> EventFuture + Send + Sync>;
type RpcNoParamFn = Arc<dyn Fn() -> RpcFuture + Send + Sync>;
type RpcParamFn = Arc<dyn Fn(String) -> RpcFuture + Send + Sync>;

/// An event handler, tagged by what it takes.
#[derive(Clone)]
pub(crate) enum EventCallback {
    Payload(EventFn),
    PayloadHeaders(EventHeaderFn),
}

impl EventCallback {
    pub(crate) fn invoke(&self, payload: String, headers: HashMap<String, String>) -> EventFuture {
        match self {
            Self::Payload(f) => f(payload),
            Self::PayloadHeaders(f) => f(payload, headers),
        }
    }
}

/// An RPC handler, tagged by whether it takes the request payload.
#[derive(Clone)]
pub(crate) enum RpcCallback {
    NoParam(RpcNoParamFn),
    Param(RpcParamFn),
}

impl RpcCallback {
    pub(crate) fn invoke(&self, payload: String) -> RpcFuture {
        match self {
            Self::NoParam(f) => f(),
            Self::Param(f) => f(payload),
        }
    }
}

/// One registered event handler: a wildcard-capable key plus its callback.
#[derive(Clone)]
pub(crate) struct RegisteredEvent {
    pub(crate) key: String,
    pub(crate) callback: EventCallback,
}

/// The two handler tables. Built before the connection opens, immutable
/// afterwards.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    events: Vec<RegisteredEvent>,
    rpcs: HashMap<String, RpcCallback>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an event handler receiving the raw payload.
    pub(crate) fn register_event<F, Fut>(&mut self, key: &str, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.push_event(
            key,
            EventCallback::Payload(Arc::new(move |payload| -> EventFuture {
                Box::pin(handler(payload))
            })),
        );
    }

    /// Register an event handler receiving the payload and the header map.
    pub(crate) fn register_event_with_headers<F, Fut>(&mut self, key: &str, handler: F)
    where
        F: Fn(String, HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.push_event(
            key,
            EventCallback::PayloadHeaders(Arc::new(move |payload, headers| -> EventFuture {
                Box::pin(handler(payload, headers))
            })),
        );
    }

    /// Register an RPC handler receiving the raw payload string.
    pub(crate) fn register_rpc<F, Fut>(&mut self, key: &str, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.push_rpc(
            key,
            RpcCallback::Param(Arc::new(move |payload| -> RpcFuture {
                Box::pin(handler(payload))
            })),
        );
    }

    /// Register an RPC handler that takes no payload.
    pub(crate) fn register_rpc_no_param<F, Fut>(&mut self, key: &str, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.push_rpc(
            key,
            RpcCallback::NoParam(Arc::new(move || -> RpcFuture { Box::pin(handler()) })),
        );
    }

    /// Register a typed RPC handler.
    ///
    /// The request payload is deserialized into `P` before the handler runs
    /// and the returned `R` is serialized into the response's `data` field.
    /// A payload that does not deserialize yields a code 500 response.
    pub(crate) fn register_rpc_json<P, R, F, Fut>(&mut self, key: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        self.register_rpc(key, move |raw: String| {
            let call = serde_json::from_str::<P>(&raw).map(&handler);
            async move {
                match call {
                    Ok(fut) => {
                        let value = fut.await?;
                        serde_json::to_value(value).map_err(RpcError::from)
                    }
                    Err(err) => Err(RpcError::from(err)),
                }
            }
        });
    }

    fn push_event(&mut self, key: &str, callback: EventCallback) {
        if let Err(reason) = validate_event_key(key) {
            warn!(key, reason, "Skipping invalid event handler registration");
            return;
        }
        debug!(key, "Registering event handler");
        self.events.push(RegisteredEvent {
            key: key.to_string(),
            callback,
        });
    }

    fn push_rpc(&mut self, key: &str, callback: RpcCallback) {
        if let Err(reason) = validate_rpc_key(key) {
            warn!(key, reason, "Skipping invalid rpc handler registration");
            return;
        }
        if self.rpcs.contains_key(key) {
            warn!(key, "Skipping duplicate rpc handler registration");
            return;
        }
        debug!(key, "Registering rpc handler");
        self.rpcs.insert(key.to_string(), callback);
    }

    pub(crate) fn events(&self) -> &[RegisteredEvent] {
        &self.events
    }

    pub(crate) fn rpc(&self, key: &str) -> Option<&RpcCallback> {
        self.rpcs.get(key)
    }

    pub(crate) fn event_keys(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.key.as_str()).collect()
    }

    pub(crate) fn rpc_keys(&self) -> Vec<&str> {
        self.rpcs.keys().map(|k| k.as_str()).collect()
    }

    pub(crate) fn has_rpc_handlers(&self) -> bool {
        !self.rpcs.is_empty()
    }

    pub(crate) fn has_event_handlers(&self) -> bool {
        !self.events.is_empty()
    }
}

/// Event keys become topic suffixes, so a leading or trailing separator
/// would produce an empty segment that never matches anything.
fn validate_event_key(key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("key is empty");
    }
    if key.starts_with('/') || key.ends_with('/') {
        return Err("key must not start or end with '/'");
    }
    Ok(())
}

/// RPC keys are a single literal topic segment.
fn validate_rpc_key(key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("key is empty");
    }
    if key.contains('/') {
        return Err("key must not contain '/'");
    }
    if key.contains('+') || key.contains('#') {
        return Err("key must not contain wildcard characters");
    }
    Ok(())
}
