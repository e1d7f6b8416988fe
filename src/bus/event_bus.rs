//! Identity-free bus endpoint and subscription lifecycle

use crate::channels::Channel;
use crate::cluster::{ClusterTransport, Envelope, LocalTransport};
use parking_lot::ReentrantMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Publish/subscribe endpoint over a cluster transport
///
/// Cheap to clone; clones share the transport and counters.
#[derive(Clone)]
pub struct EventBus {
    transport: Arc<dyn ClusterTransport>,
    stats: Arc<BusStats>,
}

#[derive(Default)]
struct BusStats {
    published: AtomicU64,
    transport_failures: AtomicU64,
}

impl EventBus {
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            transport,
            stats: Arc::new(BusStats::default()),
        }
    }

    /// A bus that only reaches subscribers in this process
    pub fn local() -> Self {
        Self::new(Arc::new(LocalTransport::new()))
    }

    /// Hand `envelope` to the transport and return immediately
    ///
    /// Delivery failures are logged and counted, never returned.
    pub fn publish(&self, envelope: Envelope) {
        let channel = envelope.channel.clone();
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.transport.publish_raw(envelope) {
            self.stats.transport_failures.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %channel, error = %e, "Message not delivered to every cluster member");
        }
    }

    /// Invoke `handler` for every envelope published to `channel`
    ///
    /// Must be called inside a Tokio runtime. Each subscription gets its own
    /// copy of every envelope; its handler runs on a dedicated task, one
    /// envelope at a time, in arrival order.
    pub fn subscribe<F>(&self, channel: &Channel, mut handler: F) -> Subscription
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.transport.subscribe_raw(channel, tx);

        let inner = Arc::new(SubscriptionInner {
            id,
            channel: channel.clone(),
            transport: self.transport.clone(),
            cancelled: AtomicBool::new(false),
            gate: ReentrantMutex::new(()),
        });

        debug!(subscription = %id, channel = %channel, "Subscribed");

        let dispatch = inner.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if !dispatch.run(|| handler(envelope)) {
                    break;
                }
            }
            debug!(subscription = %dispatch.id, "Subscription dispatch finished");
        });

        Subscription { inner }
    }

    /// Envelopes handed to the transport so far
    pub fn published(&self) -> u64 {
        self.stats.published.load(Ordering::Relaxed)
    }

    /// Publishes the transport reported as not fully delivered
    pub fn transport_failures(&self) -> u64 {
        self.stats.transport_failures.load(Ordering::Relaxed)
    }
}

struct SubscriptionInner {
    id: Uuid,
    channel: Channel,
    transport: Arc<dyn ClusterTransport>,
    cancelled: AtomicBool,
    /// Held while the handler runs; reentrant so a handler may cancel itself
    gate: ReentrantMutex<()>,
}

impl SubscriptionInner {
    /// Run one handler invocation unless cancelled; false once cancelled
    fn run(&self, invoke: impl FnOnce()) -> bool {
        let _gate = self.gate.lock();
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        invoke();
        true
    }
}

/// An active binding between a channel and a handler
///
/// Dropping the subscription cancels it.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    pub fn is_active(&self) -> bool {
        !self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Stop deliveries to this subscription
    ///
    /// Idempotent. Once it returns, the handler is not running and will not
    /// be invoked again. Sibling subscriptions on the channel are unaffected.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner
                .transport
                .unsubscribe_raw(&self.inner.channel, self.inner.id);
            debug!(subscription = %self.inner.id, channel = %self.inner.channel, "Cancelled");
        }
        // Wait out an invocation that started before the flag was set
        drop(self.inner.gate.lock());
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("channel", &self.inner.channel)
            .field("active", &self.is_active())
            .finish()
    }
}
