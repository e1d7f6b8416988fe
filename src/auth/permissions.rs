//! Bridge allowlist permissions

use crate::channels::{Channel, ChannelPattern};
use std::fmt;

/// Direction of traffic across the bridge boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// External client to internal bus (publish, request)
    Inbound,
    /// Internal bus to external client (subscribe)
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// A single permission: direction + channel pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPermission {
    pub direction: Direction,
    pub pattern: ChannelPattern,
}

impl ChannelPermission {
    pub fn new(direction: Direction, pattern: ChannelPattern) -> Self {
        Self { direction, pattern }
    }

    pub fn inbound(pattern: ChannelPattern) -> Self {
        Self::new(Direction::Inbound, pattern)
    }

    pub fn outbound(pattern: ChannelPattern) -> Self {
        Self::new(Direction::Outbound, pattern)
    }

    pub fn allows(&self, direction: Direction, channel: &Channel) -> bool {
        self.direction == direction && self.pattern.matches(channel)
    }
}

impl fmt::Display for ChannelPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.direction, self.pattern)
    }
}

/// The bridge allowlist
///
/// Anything not covered by a permission in the matching direction is denied.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    permissions: Vec<ChannelPermission>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, permission: ChannelPermission) {
        if !self.permissions.contains(&permission) {
            self.permissions.push(permission);
        }
    }

    pub fn allows(&self, direction: Direction, channel: &Channel) -> bool {
        self.permissions.iter().any(|p| p.allows(direction, channel))
    }

    pub fn can_publish(&self, channel: &Channel) -> bool {
        self.allows(Direction::Inbound, channel)
    }

    pub fn can_subscribe(&self, channel: &Channel) -> bool {
        self.allows(Direction::Outbound, channel)
    }

    pub fn permissions(&self) -> &[ChannelPermission] {
        &self.permissions
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

impl FromIterator<ChannelPermission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = ChannelPermission>>(iter: T) -> Self {
        let mut set = PermissionSet::new();
        for permission in iter {
            set.add(permission);
        }
        set
    }
}
