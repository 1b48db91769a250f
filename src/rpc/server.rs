//! RPC server half: action dispatch and response mapping.
//!
//! Requests arrive through the shared subscription on this application's
//! action namespace, so concurrent instances compete for them. Each request
//! is handled in its own task; the outcome is always mapped to a response
//! envelope:
//!
//! - unknown action: 404 without invoking anything
//! - handler `Ok(value)`: 200 with `value` as `data`
//! - handler business error: its code and message, verbatim
//! - handler panic: 500 with the panic message; full detail is logged here
//!   and never leaves the process
//!
//! The response goes to the caller's private reply topic, reconstructed from
//! the request's reply descriptor. If the connection is down by then the
//! response is dropped and the caller runs into its own timeout.

use super::{ReplyDescriptor, SynapseResponse};
use crate::synapse::SynapseInner;
use crate::transport::{InboundMessage, OutboundMessage, TransportError};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Handle one inbound request in its own task.
pub(crate) fn spawn_handle(inner: Arc<SynapseInner>, action: String, message: InboundMessage) {
    tokio::spawn(async move {
        handle(inner, action, message).await;
    });
}

async fn handle(inner: Arc<SynapseInner>, action: String, message: InboundMessage) {
    let descriptor = message
        .response_topic
        .as_deref()
        .and_then(ReplyDescriptor::parse);
    let Some(descriptor) = descriptor else {
        warn!(action, "Dropping rpc request without reply descriptor");
        return;
    };

    debug!(
        action,
        caller = %descriptor.app,
        call_id = %descriptor.call_id,
        "Rpc request received"
    );

    let response = match inner.registry.rpc(&action) {
        None => {
            warn!(action, caller = %descriptor.app, "Unknown rpc action");
            SynapseResponse::from_code(404)
        }
        Some(callback) => run_handler(&action, callback.invoke(message.payload)).await,
    };

    let reply_topic =
        inner
            .topics
            .rpc_reply(&descriptor.app, &descriptor.app_id, &descriptor.call_id);
    let outbound =
        OutboundMessage::new(reply_topic, response.to_json()).with_content_type("application/json");

    match inner.transport.publish(outbound).await {
        Ok(()) => debug!(
            action,
            caller = %descriptor.app,
            call_id = %descriptor.call_id,
            code = response.code,
            "Rpc response published"
        ),
        Err(TransportError::NotConnected) => debug!(
            action,
            call_id = %descriptor.call_id,
            "Not connected, rpc response dropped"
        ),
        Err(err) => warn!(
            action,
            call_id = %descriptor.call_id,
            error = %err,
            "Failed to publish rpc response"
        ),
    }
}

/// Run the handler future inside a task of its own so a panic is contained
/// and mapped instead of taking the request task down.
async fn run_handler(
    action: &str,
    invocation: crate::registry::RpcFuture,
) -> SynapseResponse<Value> {
    match tokio::spawn(invocation).await {
        Ok(Ok(value)) => SynapseResponse::ok(value),
        Ok(Err(err)) => {
            debug!(
                action,
                code = err.code,
                message = %err.message,
                "Rpc handler returned business error"
            );
            SynapseResponse::error(err.code, err.message)
        }
        Err(join_err) => {
            let message = match join_err.try_into_panic() {
                Ok(panic) => panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "rpc handler panicked".to_string()),
                Err(err) => err.to_string(),
            };
            error!(action, message = %message, "Rpc handler panicked");
            SynapseResponse::error(500, message)
        }
    }
}
