//! Protocol bridge between the bus and untrusted external clients
//!
//! External clients speak the JSON protocol in [`messages`] over a WebSocket.
//! Every operation is checked against the [`BridgeConfig`] allowlist before
//! anything reaches the bus: `publish`/`request` need an inbound permission
//! and `subscribe` an outbound one.

pub mod messages;
mod session;
mod websocket;

pub use messages::{BridgeEvent, BridgeRequest, FailureReason, Operation};
pub use session::{
    BridgeConfig, BridgeRejection, BridgeSession, ProtocolBridge, DEFAULT_REPLY_TIMEOUT,
};
pub use websocket::{create_router, run_bridge_server, serve_bridge, EVENTBUS_PATH};
