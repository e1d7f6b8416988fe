//! In-process transport: fan-out to subscriptions registered in this process

use crate::channels::Channel;
use crate::cluster::envelope::Envelope;
use crate::cluster::transport::{ClusterTransport, EnvelopeSink, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Routes envelopes to the sinks subscribed in this process
///
/// Cheap to clone; clones share the same subscription table.
#[derive(Clone, Default)]
pub struct LocalTransport {
    subscribers: Arc<DashMap<Channel, Vec<(Uuid, EnvelopeSink)>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to every local sink on the envelope's channel
    ///
    /// Returns the number of sinks that accepted the envelope. Sinks whose
    /// receiver is gone are pruned.
    pub fn deliver(&self, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        let mut emptied = false;

        if let Some(mut sinks) = self.subscribers.get_mut(&envelope.channel) {
            sinks.retain(|(id, sink)| match sink.send(envelope.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    debug!(subscription = %id, channel = %envelope.channel, "Pruning closed subscription");
                    false
                }
            });
            emptied = sinks.is_empty();
        }

        if emptied {
            self.subscribers
                .remove_if(&envelope.channel, |_, sinks| sinks.is_empty());
        }

        if delivered == 0 {
            debug!(channel = %envelope.channel, "No local subscribers for channel");
        }

        delivered
    }

    /// Number of live registrations on `channel`
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.subscribers
            .get(channel)
            .map(|sinks| sinks.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    async fn join_cluster(&self, address: IpAddr) -> Result<(), TransportError> {
        info!(addr = %address, "Running single-process bus");
        Ok(())
    }

    fn publish_raw(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.deliver(&envelope);
        Ok(())
    }

    fn subscribe_raw(&self, channel: &Channel, sink: EnvelopeSink) -> Uuid {
        let id = Uuid::new_v4();
        self.subscribers
            .entry(channel.clone())
            .or_default()
            .push((id, sink));
        id
    }

    fn unsubscribe_raw(&self, channel: &Channel, id: Uuid) {
        if let Some(mut sinks) = self.subscribers.get_mut(channel) {
            sinks.retain(|(sid, _)| *sid != id);
        }
        self.subscribers
            .remove_if(channel, |_, sinks| sinks.is_empty());
    }
}
