//! # Synapse
//!
//! Process-to-process messaging over an MQTT-style broker: topic
//! hierarchies, wildcard subscriptions, retained messages and shared
//! (competing-consumer) subscriptions.
//!
//! Three capabilities on one connection:
//!
//! - **Events**: fire-and-forget notifications, broadcast to every instance
//!   of an application or load-balanced across them.
//! - **RPC**: request/response calls addressed by application name and
//!   action, correlated over the asynchronous transport by call id.
//! - **Config store**: a retained key/value store shared across the system,
//!   materialized locally and kept current by subscription.
//!
//! ## Architecture
//!
//! ```text
//! host handlers -> SynapseBuilder -> Synapse -> Transport -> Broker
//!                                       ▲
//!                         dispatcher ───┘ (events, rpc, config)
//! ```
//!
//! ## Modules
//!
//! - [`config`]: instance options, TOML loading
//! - [`registry`]: handler registration and validation
//! - [`transport`]: broker connection (MQTT and in-memory)
//! - [`event`]: event bus
//! - [`rpc`]: correlated request/response
//! - [`store`]: retained configuration store
//!
//! ## Example
//!
//! ```rust,ignore
//! use synapse::{Synapse, SynapseConfig, RpcError};
//!
//! let mut builder = Synapse::builder(SynapseConfig::new(
//!     "mqtt://broker:1883",
//!     "acme",
//!     "billing",
//! ));
//! builder.register_rpc_json("Invoices.Get", |id: u64| async move {
//!     if id == 0 {
//!         return Err(RpcError::new(404, "no such invoice"));
//!     }
//!     Ok(format!("invoice-{id}"))
//! });
//! let synapse = builder.connect().await?;
//!
//! synapse.fire_event("invoice/created", &"inv-1").await?;
//! let res = synapse.rpc::<String, _>("ledger", "Entries.Count", &()).await?;
//! ```

pub mod config;
pub mod event;
pub mod registry;
pub mod rpc;
pub mod shutdown;
pub mod store;
pub mod synapse;
mod topic;
pub mod transport;

// Re-export the surface most hosts need at crate root.
pub use config::{ConfigError, SynapseConfig};
pub use event::EventError;
pub use registry::{HandlerError, RpcError};
pub use rpc::{RpcCallError, SynapseResponse};
pub use shutdown::ShutdownSignal;
pub use store::{ConfigEntry, StoreError};
pub use synapse::{Synapse, SynapseBuilder, SynapseError};
pub use transport::{
    ConnectionState, InboundMessage, MemoryBroker, MemoryTransport, MqttTransport,
    OutboundMessage, Transport, TransportError, TransportEvent,
};
