//! RPC over the broker.
//!
//! A call is a publish to the target application's action topic carrying a
//! reply descriptor; the response is a single publish back to the caller's
//! private per-instance reply topic, correlated by call id. [`client`] owns
//! the outbound half and the pending-call table, [`server`] the inbound half.
//!
//! Everything on the wire is a [`SynapseResponse`] envelope serialized as
//! camelCase JSON: `{"code": 200, "message": "ok", "data": ...}`.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced to the local caller of `rpc`.
///
/// Remote failures are not errors here: they arrive as a [`SynapseResponse`]
/// with a non-200 code, including the locally synthesized 502 on timeout.
#[derive(Debug, Error)]
pub enum RpcCallError {
    #[error("rpc client disabled by configuration")]
    Disabled,

    #[error("not connected to broker")]
    NotConnected,

    #[error(transparent)]
    Transport(crate::transport::TransportError),

    #[error("failed to encode rpc parameter: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode rpc response: {0}")]
    Decode(serde_json::Error),
}

/// The structured response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: Deserialize<'de>"))]
pub struct SynapseResponse<T = Value> {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> SynapseResponse<T> {
    /// A 200 response wrapping a handler's return value.
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            message: default_message(200).to_string(),
            data: Some(data),
        }
    }

    /// An error response with an explicit message.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// An error response carrying the default message for `code`.
    pub fn from_code(code: u16) -> Self {
        Self::error(code, default_message(code))
    }

    pub fn is_ok(&self) -> bool {
        self.code == 200
    }
}

impl<T: Serialize> SynapseResponse<T> {
    /// Serialize for the wire. Cannot reasonably fail for the types that go
    /// through here; if it ever does, the caller still gets a valid envelope.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":{},"message":"response serialization failed"}}"#,
                self.code
            )
        })
    }
}

/// Default messages per response code.
fn default_message(code: u16) -> &'static str {
    match code {
        200 => "ok",
        204 => "no content",
        400 => "bad request",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "method not found",
        500 => "server error",
        502 => "timeout",
        _ => "unknown error",
    }
}

/// Reply routing carried with each request: who to answer, and under which
/// call id. Encoded on the wire as `"{app},{appId},{callId}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplyDescriptor {
    pub(crate) app: String,
    pub(crate) app_id: String,
    pub(crate) call_id: String,
}

impl ReplyDescriptor {
    pub(crate) fn new(app: &str, app_id: &str, call_id: &str) -> Self {
        Self {
            app: app.to_string(),
            app_id: app_id.to_string(),
            call_id: call_id.to_string(),
        }
    }

    pub(crate) fn encode(&self) -> String {
        format!("{},{},{}", self.app, self.app_id, self.call_id)
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ',');
        let app = parts.next()?;
        let app_id = parts.next()?;
        let call_id = parts.next()?;
        if app.is_empty() || app_id.is_empty() || call_id.is_empty() {
            return None;
        }
        Some(Self::new(app, app_id, call_id))
    }
}
