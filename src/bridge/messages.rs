//! Bridge wire protocol
//!
//! JSON text frames, tagged by `type`. Channel names travel as plain strings
//! and are validated by the session, so an unknown or malformed name is
//! answered like any other non-allowlisted channel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Messages from an external client to the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    /// Fire-and-forget publish into the bus
    Publish {
        channel: String,
        body: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    /// Publish and wait for a single reply
    Request {
        id: u64,
        channel: String,
        body: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping { seq: u64 },
}

/// Messages from the bridge to an external client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Published { channel: String },
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    /// A bus message on a subscribed channel
    Message {
        channel: String,
        body: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Answer to a `request`
    Reply {
        id: u64,
        body: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Operation on a channel outside the allowlist
    Denied {
        operation: Operation,
        channel: String,
        message: String,
    },
    RequestFailed { id: u64, reason: FailureReason },
    Pong { seq: u64 },
    Error { message: String },
}

/// The refused operation, so clients can match a denial to what they sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Publish,
    Subscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Denied,
}
