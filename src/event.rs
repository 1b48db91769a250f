//! Event bus.
//!
//! The publish half fires an event under this application's name; the
//! dispatch half receives events for the keys the host registered and runs
//! every matching handler.
//!
//! Events are fire-and-forget. There is no acknowledgment path back to the
//! publisher: a handler failure is logged on the receiving side and affects
//! nothing else, and every matching handler runs as its own task, so a slow
//! or failing handler cannot hold up its neighbors.

use crate::synapse::SynapseInner;
use crate::topic::topic_matches;
use crate::transport::{InboundMessage, OutboundMessage, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors surfaced by the publish half.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("serialization error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(TransportError),
}

/// Publish an already-encoded event payload.
///
/// Returns `Ok(false)` without publishing when the transport is not
/// connected; events are dropped in that state, never queued.
pub(crate) async fn fire(
    inner: &SynapseInner,
    event_name: &str,
    payload: String,
    headers: Vec<(String, String)>,
) -> Result<bool, EventError> {
    let message = OutboundMessage::new(inner.topics.event_publish(event_name), payload)
        .with_headers(headers);

    match inner.transport.publish(message).await {
        Ok(()) => {
            debug!(
                event = event_name,
                app = %inner.config.app_name,
                "Event published"
            );
            Ok(true)
        }
        Err(TransportError::NotConnected) => {
            warn!(event = event_name, "Not connected, event dropped");
            Ok(false)
        }
        Err(err) => Err(EventError::Transport(err)),
    }
}

/// Dispatch an inbound event to every registered handler whose key matches.
///
/// `event_name` is the inbound topic with the event prefix stripped. Each
/// matching handler runs in its own task; failures are logged and isolated.
pub(crate) fn dispatch(inner: &Arc<SynapseInner>, event_name: &str, message: InboundMessage) {
    let matching: Vec<_> = inner
        .registry
        .events()
        .iter()
        .filter(|handler| topic_matches(&handler.key, event_name))
        .collect();

    debug!(
        event = event_name,
        handlers = matching.len(),
        "Event received"
    );

    for handler in matching {
        let key = handler.key.clone();
        let callback = handler.callback.clone();
        let payload = message.payload.clone();
        let headers = message.headers.clone();
        let event_name = event_name.to_string();

        tokio::spawn(async move {
            if let Err(err) = callback.invoke(payload, headers).await {
                error!(
                    event = %event_name,
                    key = %key,
                    error = %err,
                    "Event handler failed"
                );
            }
        });
    }
}
