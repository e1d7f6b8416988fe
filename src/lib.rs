//! Chatbus - clustered chat bus with signed sender handles
//!
//! Nodes on a local network join a TCP mesh and exchange short text messages
//! on named channels. Every message carries the sender's handle and, when a
//! shared secret is configured, an HMAC token proving it. A protocol bridge
//! exposes an allowlisted subset of channels to browsers over WebSocket.

pub mod auth;
pub mod bridge;
pub mod bus;
pub mod channels;
pub mod cluster;
pub mod config;

pub use auth::{Authenticity, SharedSecret, TokenSigner, Verifier};
pub use bridge::{BridgeConfig, ProtocolBridge};
pub use bus::{AuthPolicy, ChatBusClient, ClientIdentity, EventBus, InboundMessage, Subscription};
pub use channels::{Channel, ChannelPattern};
pub use cluster::{cluster_address, select_cluster_address, Envelope};
pub use config::NodeConfig;
