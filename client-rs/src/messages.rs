//! Message types for the chatbus bridge protocol
//!
//! These mirror the bridge-side message definitions to ensure protocol compatibility.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Messages sent from client to bridge
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Publish a message to a channel
    Publish {
        channel: String,
        body: String,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },

    /// Publish and wait for one reply
    Request {
        id: u64,
        channel: String,
        body: String,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },

    /// Start receiving a channel
    Subscribe { channel: String },

    /// Stop receiving a channel
    Unsubscribe { channel: String },

    /// Ping for keepalive
    Ping { seq: u64 },
}

/// Messages received from the bridge
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Publish forwarded
    Published { channel: String },

    /// Subscription confirmed
    Subscribed { channel: String },

    /// Unsubscription confirmed
    Unsubscribed { channel: String },

    /// Incoming message on a subscribed channel
    Message {
        channel: String,
        body: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },

    /// Reply to a request
    Reply {
        id: u64,
        body: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },

    /// Channel not allowlisted for the operation
    Denied {
        operation: Operation,
        channel: String,
        message: String,
    },

    /// Request gave up
    RequestFailed { id: u64, reason: FailureReason },

    /// Pong response
    Pong { seq: u64 },

    /// Generic error
    Error { message: String },
}

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

/// A message received from the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub channel: String,
    pub body: String,
    pub headers: BTreeMap<String, String>,
}

impl ChatMessage {
    /// The sender's handle, empty if the message carried none
    pub fn sender(&self) -> &str {
        self.headers.get("handle").map(String::as_str).unwrap_or("")
    }
}
