//! Cluster transport abstraction
//!
//! The bus core never talks to the network directly. Membership and
//! cross-process delivery sit behind [`ClusterTransport`], whose contract is:
//! an envelope published to channel C reaches every current member
//! subscribed to C, at most once per subscription, in publish order per
//! publisher. Nothing is acknowledged or retried.

use crate::channels::Channel;
use crate::cluster::envelope::Envelope;
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Where a transport hands envelopes for one local subscription
pub type EnvelopeSink = mpsc::UnboundedSender<Envelope>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind cluster listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cluster already joined at {0}")]
    AlreadyJoined(SocketAddr),

    #[error("{unreachable} of {total} cluster peers unreachable")]
    Unreachable { unreachable: usize, total: usize },
}

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Join the cluster, advertising `address`
    async fn join_cluster(&self, address: IpAddr) -> Result<(), TransportError>;

    /// Hand `envelope` off for delivery and return without waiting
    ///
    /// Local subscribers are always attempted. An error only reports that
    /// some remote members could not be reached for this envelope.
    fn publish_raw(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Register `sink` for envelopes on `channel`
    fn subscribe_raw(&self, channel: &Channel, sink: EnvelopeSink) -> Uuid;

    /// Remove a registration; unknown ids are ignored
    fn unsubscribe_raw(&self, channel: &Channel, id: Uuid);
}
