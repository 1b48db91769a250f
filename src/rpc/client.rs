//! RPC client half: correlated requests and the pending-call table.
//!
//! Each outbound call parks a oneshot sender in the pending table under a
//! fresh call id, publishes the request, and waits for the response or the
//! configured timeout. The response arrives on this instance's private
//! reply topic with the call id as the trailing segment.
//!
//! The pending table is touched from two sides (the dispatcher resolving
//! responses, the calling task timing out) and removal is the tie-breaker:
//! whoever removes the entry first wins, the other side's completion is a
//! no-op.

use super::{ReplyDescriptor, RpcCallError, SynapseResponse};
use crate::synapse::SynapseInner;
use crate::transport::{OutboundMessage, TransportError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Issue a correlated request and wait for the raw response body.
///
/// This layer deals only in encoded strings; typed decoding happens in the
/// outward-facing wrapper. Timeout and internal failures are synthesized as
/// envelope JSON so the caller always decodes a structured response, except
/// for transport-level failures which are surfaced as errors without ever
/// creating a pending entry.
pub(crate) async fn fire_rpc(
    inner: &SynapseInner,
    app: &str,
    action: &str,
    payload: String,
    headers: Vec<(String, String)>,
) -> Result<String, RpcCallError> {
    let call_id = Uuid::new_v4().to_string();
    let descriptor = ReplyDescriptor::new(&inner.config.app_name, &inner.app_id, &call_id);

    let (completion_tx, completion_rx) = oneshot::channel();
    inner.pending.lock().insert(call_id.clone(), completion_tx);

    let message = OutboundMessage::new(inner.topics.rpc_request(app, action), payload)
        .with_response_topic(descriptor.encode())
        .with_content_type("application/json")
        .with_headers(headers);

    if let Err(err) = inner.transport.publish(message).await {
        // Net effect: a failed publish leaves no pending entry behind.
        inner.pending.lock().remove(&call_id);
        return Err(match err {
            TransportError::NotConnected => RpcCallError::NotConnected,
            other => RpcCallError::Transport(other),
        });
    }

    debug!(
        call_id = %call_id,
        app,
        action,
        caller = %inner.config.app_name,
        "Rpc request sent"
    );

    let timeout = Duration::from_secs(inner.config.rpc_timeout_secs);
    match tokio::time::timeout(timeout, completion_rx).await {
        Ok(Ok(body)) => {
            debug!(call_id = %call_id, app, action, "Rpc response received");
            Ok(body)
        }
        Ok(Err(_)) => {
            // Completion sender dropped without resolving; only possible if
            // the dispatcher went away mid-call.
            inner.pending.lock().remove(&call_id);
            warn!(call_id = %call_id, app, action, "Rpc completion dropped");
            Ok(SynapseResponse::<()>::error(500, "rpc client error").to_json())
        }
        Err(_) => {
            inner.pending.lock().remove(&call_id);
            warn!(
                call_id = %call_id,
                app,
                action,
                timeout_secs = timeout.as_secs(),
                "Rpc call timed out"
            );
            Ok(SynapseResponse::<()>::from_code(502).to_json())
        }
    }
}

/// Resolve an inbound response against the pending table.
///
/// `call_id` is the trailing segment of the reply topic. A response whose
/// entry is gone (already resolved, or timed out) is ignored.
pub(crate) fn resolve_response(inner: &SynapseInner, call_id: &str, body: String) {
    match inner.pending.lock().remove(call_id) {
        Some(completion) => {
            if completion.send(body).is_err() {
                debug!(call_id, "Rpc caller gone before response arrived");
            }
        }
        None => {
            debug!(call_id, "Ignoring rpc response with no pending call");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SynapseConfig;
    use crate::registry::RpcError;
    use crate::synapse::Synapse;
    use crate::transport::{MemoryBroker, OutboundMessage, Transport};
    use serde_json::Value;
    use std::time::Duration;

    fn config(app: &str) -> SynapseConfig {
        let mut config = SynapseConfig::new("mem://", "testsys", app);
        config.app_id = Some(format!("{app}-1"));
        config.rpc_timeout_secs = 1;
        config
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_synthesizes_502_and_clears_pending() {
        let broker = MemoryBroker::new();
        let (transport, events) = broker.attach().await;
        let synapse = Synapse::builder(config("caller"))
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        // Nobody serves "ghost", so the call can only time out.
        let response: crate::SynapseResponse<Value> = synapse
            .rpc("ghost", "Ghost.Call", &serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(response.code, 502);
        assert_eq!(response.message, "timeout");
        assert!(response.data.is_none());
        assert_eq!(synapse.pending_call_count(), 0);

        synapse.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_a_harmless_no_op() {
        let broker = MemoryBroker::new();
        let (transport, events) = broker.attach().await;
        let synapse = Synapse::builder(config("caller"))
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        let response: crate::SynapseResponse<Value> = synapse
            .rpc("ghost", "Ghost.Call", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(response.code, 502);

        // Simulate the response arriving after the timeout: publish straight
        // to the caller's reply topic with some call id that is no longer
        // pending.
        let (late, _late_events) = broker.attach().await;
        late.publish(OutboundMessage::new(
            "testsys/caller/rpc/client/caller-1/no-longer-pending",
            r#"{"code":200,"message":"ok"}"#,
        ))
        .await
        .unwrap();
        settle().await;

        assert_eq!(synapse.pending_call_count(), 0);
        synapse.close().await;
    }

    #[tokio::test]
    async fn test_not_connected_creates_no_pending_entry() {
        let broker = MemoryBroker::new();
        let (transport, events) = broker.attach().await;
        let synapse = Synapse::builder(config("caller"))
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        broker.interrupt_all().await;
        settle().await;

        let result = synapse
            .rpc::<Value, _>("anyone", "Any.Call", &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(crate::RpcCallError::NotConnected)));
        assert_eq!(synapse.pending_call_count(), 0);

        synapse.close().await;
    }

    #[tokio::test]
    async fn test_disabled_client_fails_fast() {
        let broker = MemoryBroker::new();
        let mut config = config("caller");
        config.disable_rpc_client = true;

        let (transport, events) = broker.attach().await;
        let synapse = Synapse::builder(config)
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        let result = synapse
            .rpc::<Value, _>("anyone", "Any.Call", &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(crate::RpcCallError::Disabled)));

        synapse.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_calls_correlate_independently() {
        let broker = MemoryBroker::new();

        let mut server_builder = Synapse::builder(config("server"));
        server_builder.register_rpc("Echo.Tagged", |raw: String| async move {
            Ok(Value::from(format!("echo:{raw}")))
        });
        let (transport, events) = broker.attach().await;
        let server = server_builder.connect_with(transport, events).await.unwrap();

        let (transport, events) = broker.attach().await;
        let client = Synapse::builder(config("caller"))
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        let first = client.rpc::<String, _>("server", "Echo.Tagged", &"a");
        let second = client.rpc::<String, _>("server", "Echo.Tagged", &"b");
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap().data.as_deref(), Some("echo:a"));
        assert_eq!(second.unwrap().data.as_deref(), Some("echo:b"));
        assert_eq!(client.pending_call_count(), 0);

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_business_error_never_becomes_call_error() {
        let broker = MemoryBroker::new();

        let mut server_builder = Synapse::builder(config("server"));
        server_builder.register_rpc("Always.Fails", |_| async {
            Err(RpcError::new(429, "slow down"))
        });
        let (transport, events) = broker.attach().await;
        let server = server_builder.connect_with(transport, events).await.unwrap();

        let (transport, events) = broker.attach().await;
        let client = Synapse::builder(config("caller"))
            .connect_with(transport, events)
            .await
            .unwrap();
        settle().await;

        let response = client
            .rpc::<Value, _>("server", "Always.Fails", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(response.code, 429);
        assert_eq!(response.message, "slow down");

        client.close().await;
        server.close().await;
    }
}
