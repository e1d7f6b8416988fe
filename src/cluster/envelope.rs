//! The unit of delivery on the cluster bus

use crate::channels::Channel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header carrying the sender's handle
pub const HEADER_HANDLE: &str = "handle";
/// Header carrying the sender's token, present iff the sender signed
pub const HEADER_TOKEN: &str = "token";
/// Header naming the channel a reply should be published to
pub const HEADER_REPLY_TO: &str = "reply_to";

/// A message addressed to a channel, with string headers and a text body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl Envelope {
    pub fn new(channel: Channel, body: impl Into<String>) -> Self {
        Self {
            channel,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// A chat message: `handle` always, `token` only when non-empty
    pub fn chat(
        channel: Channel,
        body: impl Into<String>,
        handle: &str,
        token: Option<&str>,
    ) -> Self {
        let mut envelope = Self::new(channel, body).with_header(HEADER_HANDLE, handle);
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            envelope = envelope.with_header(HEADER_TOKEN, token);
        }
        envelope
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn handle(&self) -> Option<&str> {
        self.header(HEADER_HANDLE)
    }

    pub fn token(&self) -> Option<&str> {
        self.header(HEADER_TOKEN)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.header(HEADER_REPLY_TO)
    }
}
