//! Channel naming and allowlist patterns
//!
//! Channels are dot-separated segments: `general`, `room.lobby`.
//! Each segment must match: [a-zA-Z0-9_-]+
//!
//! Patterns are used by the bridge allowlist and may end in a wildcard:
//! - `general` matches only `general`
//! - `room.*` matches `room.lobby`, `room.lobby.typing`
//! - `*` matches everything

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

fn is_valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel name cannot be empty")]
    Empty,

    #[error("invalid segment '{0}': must match [a-zA-Z0-9_-]+")]
    InvalidSegment(String),

    #[error("wildcard '*' can only appear as the last segment")]
    WildcardNotAtEnd,

    #[error("empty segment in channel name")]
    EmptySegment,
}

fn validate_segments(name: &str) -> Result<(), ChannelError> {
    for part in name.split('.') {
        if part.is_empty() {
            return Err(ChannelError::EmptySegment);
        }
        if part.contains('*') {
            return Err(ChannelError::WildcardNotAtEnd);
        }
        if !is_valid_segment(part) {
            return Err(ChannelError::InvalidSegment(part.to_string()));
        }
    }
    Ok(())
}

/// A validated channel name (no wildcards)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    pub fn parse(name: &str) -> Result<Self, ChannelError> {
        if name.is_empty() {
            return Err(ChannelError::Empty);
        }
        validate_segments(name)?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Channel {
    type Error = ChannelError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Channel::parse(&name)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A channel name or a trailing-wildcard prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelPattern {
    /// Full name for exact patterns, prefix before `.*` otherwise
    prefix: String,
    is_wildcard: bool,
}

impl ChannelPattern {
    pub fn parse(pattern: &str) -> Result<Self, ChannelError> {
        if pattern.is_empty() {
            return Err(ChannelError::Empty);
        }

        if pattern == "*" {
            return Ok(Self {
                prefix: String::new(),
                is_wildcard: true,
            });
        }

        let (prefix, is_wildcard) = match pattern.strip_suffix(".*") {
            Some(prefix) => (prefix, true),
            None => (pattern, false),
        };
        validate_segments(prefix)?;

        Ok(Self {
            prefix: prefix.to_string(),
            is_wildcard,
        })
    }

    pub fn matches(&self, channel: &Channel) -> bool {
        let name = channel.as_str();
        if !self.is_wildcard {
            return name == self.prefix;
        }
        if self.prefix.is_empty() {
            return true;
        }
        name.len() > self.prefix.len()
            && name.starts_with(&self.prefix)
            && name.as_bytes()[self.prefix.len()] == b'.'
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_wildcard, self.prefix.is_empty()) {
            (true, true) => f.write_str("*"),
            (true, false) => write!(f, "{}.*", self.prefix),
            (false, _) => f.write_str(&self.prefix),
        }
    }
}
