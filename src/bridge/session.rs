//! Allowlist enforcement and per-connection bridge state

use crate::auth::{ChannelPermission, Direction, PermissionSet};
use crate::bridge::messages::{BridgeEvent, BridgeRequest, FailureReason, Operation};
use crate::bus::{EventBus, Subscription};
use crate::channels::{Channel, ChannelError, ChannelPattern};
use crate::cluster::{Envelope, HEADER_HANDLE, HEADER_REPLY_TO, HEADER_TOKEN};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reply timeout used by the daemon
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(2500);

/// Channel prefix for request reply addresses
const REPLY_CHANNEL_PREFIX: &str = "_bridge.reply";

/// Per-session queue of events waiting to be written to the socket
const SESSION_QUEUE_DEPTH: usize = 100;

/// Why a bridge operation was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeRejection {
    #[error("{direction} access to '{channel}' not permitted")]
    Denied { channel: String, direction: Direction },

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub permissions: PermissionSet,
    pub reply_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(permissions: PermissionSet, reply_timeout: Duration) -> Self {
        Self {
            permissions,
            reply_timeout,
        }
    }

    /// Allow each channel pattern in both directions
    pub fn configure<I, S>(channels: I, reply_timeout_ms: u64) -> Result<Self, ChannelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut permissions = PermissionSet::new();
        for channel in channels {
            let pattern = ChannelPattern::parse(channel.as_ref())?;
            permissions.add(ChannelPermission::inbound(pattern.clone()));
            permissions.add(ChannelPermission::outbound(pattern));
        }
        Ok(Self::new(
            permissions,
            Duration::from_millis(reply_timeout_ms),
        ))
    }
}

/// Exposes an allowlisted slice of the bus to untrusted clients
pub struct ProtocolBridge {
    config: Arc<BridgeConfig>,
    bus: EventBus,
    in_flight: Arc<AtomicUsize>,
}

impl ProtocolBridge {
    pub fn new(config: BridgeConfig, bus: EventBus) -> Self {
        info!(
            permissions = %config
                .permissions
                .permissions()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
            reply_timeout_ms = config.reply_timeout.as_millis() as u64,
            "Bridge configured"
        );
        Self {
            config: Arc::new(config),
            bus,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Requests across all sessions still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// State for one external connection, plus the events to send it
    pub fn open_session(&self) -> (BridgeSession, mpsc::Receiver<BridgeEvent>) {
        let (events, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let session = BridgeSession {
            id: Uuid::new_v4(),
            config: self.config.clone(),
            bus: self.bus.clone(),
            events,
            subscriptions: HashMap::new(),
            pending: JoinSet::new(),
            in_flight: self.in_flight.clone(),
        };
        (session, rx)
    }
}

/// One external client's view of the bridge
///
/// Dropping the session cancels its subscriptions and abandons its pending
/// requests.
pub struct BridgeSession {
    id: Uuid,
    config: Arc<BridgeConfig>,
    bus: EventBus,
    events: mpsc::Sender<BridgeEvent>,
    subscriptions: HashMap<Channel, Subscription>,
    pending: JoinSet<()>,
    in_flight: Arc<AtomicUsize>,
}

impl BridgeSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Channels this session currently receives
    pub fn subscribed_channels(&self) -> Vec<&Channel> {
        self.subscriptions.keys().collect()
    }

    /// Decode and handle one text frame
    pub async fn handle_text(&mut self, frame: &str) {
        match serde_json::from_str::<BridgeRequest>(frame) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                debug!(session = %self.id, error = %e, "Unparseable bridge frame");
                self.emit(BridgeEvent::Error {
                    message: "invalid request".to_string(),
                })
                .await;
            }
        }
    }

    pub async fn handle(&mut self, request: BridgeRequest) {
        while self.pending.try_join_next().is_some() {}

        match request {
            BridgeRequest::Publish {
                channel,
                body,
                headers,
            } => match self.authorize(&channel, Direction::Inbound) {
                Ok(channel) => {
                    debug!(session = %self.id, channel = %channel, "Forwarding publish");
                    self.bus.publish(inbound_envelope(channel.clone(), body, &headers));
                    self.emit(BridgeEvent::Published {
                        channel: channel.into(),
                    })
                    .await;
                }
                Err(rejection) => self.deny(rejection).await,
            },
            BridgeRequest::Request {
                id,
                channel,
                body,
                headers,
            } => match self.authorize(&channel, Direction::Inbound) {
                Ok(channel) => self.start_request(id, channel, body, &headers).await,
                Err(rejection) => {
                    warn!(session = %self.id, %rejection, "Bridge request rejected");
                    self.emit(BridgeEvent::RequestFailed {
                        id,
                        reason: FailureReason::Denied,
                    })
                    .await;
                }
            },
            BridgeRequest::Subscribe { channel } => {
                match self.authorize(&channel, Direction::Outbound) {
                    Ok(channel) => {
                        if !self.subscriptions.contains_key(&channel) {
                            let subscription = self.forward_channel(&channel);
                            self.subscriptions.insert(channel.clone(), subscription);
                        }
                        self.emit(BridgeEvent::Subscribed {
                            channel: channel.into(),
                        })
                        .await;
                    }
                    Err(rejection) => self.deny(rejection).await,
                }
            }
            BridgeRequest::Unsubscribe { channel } => {
                if let Ok(parsed) = Channel::parse(&channel) {
                    if self.subscriptions.remove(&parsed).is_some() {
                        debug!(session = %self.id, channel = %parsed, "Bridge client unsubscribed");
                    }
                }
                self.emit(BridgeEvent::Unsubscribed { channel }).await;
            }
            BridgeRequest::Ping { seq } => {
                self.emit(BridgeEvent::Pong { seq }).await;
            }
        }
    }

    /// Resolve `channel` if the allowlist covers it in `direction`
    fn authorize(&self, channel: &str, direction: Direction) -> Result<Channel, BridgeRejection> {
        let denied = || BridgeRejection::Denied {
            channel: channel.to_string(),
            direction,
        };
        let parsed = Channel::parse(channel).map_err(|_| denied())?;
        if self.config.permissions.allows(direction, &parsed) {
            Ok(parsed)
        } else {
            Err(denied())
        }
    }

    async fn deny(&self, rejection: BridgeRejection) {
        warn!(session = %self.id, %rejection, "Bridge operation rejected");
        if let BridgeRejection::Denied { channel, direction } = rejection {
            let (operation, message) = match direction {
                Direction::Inbound => (Operation::Publish, "publish not permitted"),
                Direction::Outbound => (Operation::Subscribe, "subscribe not permitted"),
            };
            self.emit(BridgeEvent::Denied {
                operation,
                channel,
                message: message.to_string(),
            })
            .await;
        }
    }

    /// Mirror bus traffic on `channel` to this session
    fn forward_channel(&self, channel: &Channel) -> Subscription {
        let events = self.events.clone();
        let session = self.id;
        self.bus.subscribe(channel, move |envelope| {
            let headers = outbound_headers(&envelope);
            let event = BridgeEvent::Message {
                channel: envelope.channel.into(),
                body: envelope.body,
                headers,
            };
            if events.try_send(event).is_err() {
                debug!(session = %session, "Bridge client not keeping up, dropping message");
            }
        })
    }

    async fn start_request(
        &mut self,
        id: u64,
        channel: Channel,
        body: String,
        headers: &BTreeMap<String, String>,
    ) {
        let reply_channel = match Channel::parse(&format!(
            "{REPLY_CHANNEL_PREFIX}.{}",
            Uuid::new_v4().simple()
        )) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(session = %self.id, error = %e, "Could not allocate reply address");
                self.emit(BridgeEvent::Error {
                    message: "invalid request".to_string(),
                })
                .await;
                return;
            }
        };

        // Listen before publishing so a fast reply is not missed
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut reply_tx = Some(reply_tx);
        let reply_subscription = self.bus.subscribe(&reply_channel, move |envelope| {
            if let Some(tx) = reply_tx.take() {
                let _ = tx.send(envelope);
            }
        });

        let envelope = inbound_envelope(channel, body, headers)
            .with_header(HEADER_REPLY_TO, reply_channel.as_str());
        self.bus.publish(envelope);

        let guard = InFlight::enter(self.in_flight.clone());
        let events = self.events.clone();
        let reply_timeout = self.config.reply_timeout;
        let session = self.id;

        self.pending.spawn(async move {
            let outcome = tokio::time::timeout(reply_timeout, reply_rx).await;
            drop(reply_subscription);
            drop(guard);

            let event = match outcome {
                Ok(Ok(reply)) => BridgeEvent::Reply {
                    id,
                    headers: outbound_headers(&reply),
                    body: reply.body,
                },
                _ => {
                    debug!(session = %session, request = id, "{}", BridgeRejection::Timeout(reply_timeout));
                    BridgeEvent::RequestFailed {
                        id,
                        reason: FailureReason::Timeout,
                    }
                }
            };
            let _ = events.send(event).await;
        });
    }

    async fn emit(&self, event: BridgeEvent) {
        if self.events.send(event).await.is_err() {
            debug!(session = %self.id, "Bridge client gone, dropping event");
        }
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        debug!(
            session = %self.id,
            subscriptions = self.subscriptions.len(),
            pending = self.pending.len(),
            "Closing bridge session"
        );
    }
}

/// Counts one outstanding request until dropped
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Envelope for a bridged publish: only identity headers are carried over
fn inbound_envelope(channel: Channel, body: String, headers: &BTreeMap<String, String>) -> Envelope {
    let mut envelope = Envelope::new(channel, body);
    for key in [HEADER_HANDLE, HEADER_TOKEN] {
        if let Some(value) = headers.get(key).filter(|v| !v.is_empty()) {
            envelope = envelope.with_header(key, value.clone());
        }
    }
    envelope
}

/// Headers exposed to external clients; tokens never leave the bus
fn outbound_headers(envelope: &Envelope) -> BTreeMap<String, String> {
    envelope
        .handle()
        .map(|handle| BTreeMap::from([(HEADER_HANDLE.to_string(), handle.to_string())]))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalTransport;
    use tokio::time::timeout;

    fn general_bridge(bus: EventBus) -> ProtocolBridge {
        ProtocolBridge::new(BridgeConfig::configure(["general"], 2500).unwrap(), bus)
    }

    async fn next(rx: &mut mpsc::Receiver<BridgeEvent>) -> BridgeEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event")
            .expect("open")
    }

    #[test]
    fn test_configure_general() {
        let config = BridgeConfig::configure(["general"], 2500).unwrap();
        let general = Channel::parse("general").unwrap();
        let other = Channel::parse("other-channel").unwrap();

        assert_eq!(config.reply_timeout, DEFAULT_REPLY_TIMEOUT);
        assert!(config.permissions.can_publish(&general));
        assert!(config.permissions.can_subscribe(&general));
        assert!(!config.permissions.can_publish(&other));
        assert!(BridgeConfig::configure(["bad name"], 10).is_err());
    }

    #[test]
    fn test_inbound_envelope_keeps_identity_headers_only() {
        let headers = BTreeMap::from([
            ("handle".to_string(), "web".to_string()),
            ("token".to_string(), String::new()),
            ("reply_to".to_string(), "general".to_string()),
        ]);
        let env = inbound_envelope(Channel::parse("general").unwrap(), "hi".into(), &headers);
        assert_eq!(env.handle(), Some("web"));
        assert_eq!(env.token(), None);
        assert_eq!(env.reply_to(), None);
    }

    #[tokio::test]
    async fn test_publish_denied_generates_no_traffic() {
        let transport = Arc::new(LocalTransport::new());
        let bus = EventBus::new(transport);
        let bridge = general_bridge(bus.clone());
        let (mut session, mut rx) = bridge.open_session();

        session
            .handle(BridgeRequest::Publish {
                channel: "other-channel".into(),
                body: "sneaky".into(),
                headers: BTreeMap::new(),
            })
            .await;

        assert!(matches!(next(&mut rx).await, BridgeEvent::Denied { channel, .. } if channel == "other-channel"));
        assert_eq!(bus.published(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_forwards_without_token() {
        let bus = EventBus::local();
        let bridge = general_bridge(bus.clone());
        let (mut session, mut rx) = bridge.open_session();

        session
            .handle(BridgeRequest::Subscribe {
                channel: "general".into(),
            })
            .await;
        assert_eq!(
            next(&mut rx).await,
            BridgeEvent::Subscribed {
                channel: "general".into()
            }
        );

        let general = Channel::parse("general").unwrap();
        bus.publish(Envelope::chat(general, "hello", "bob", Some("abc=")));

        match next(&mut rx).await {
            BridgeEvent::Message {
                channel,
                body,
                headers,
            } => {
                assert_eq!(channel, "general");
                assert_eq!(body, "hello");
                assert_eq!(headers.get("handle").map(String::as_str), Some("bob"));
                assert!(!headers.contains_key("token"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_denied_outside_allowlist() {
        let bridge = general_bridge(EventBus::local());
        let (mut session, mut rx) = bridge.open_session();

        session
            .handle(BridgeRequest::Subscribe {
                channel: "other-channel".into(),
            })
            .await;

        assert!(matches!(
            next(&mut rx).await,
            BridgeEvent::Denied {
                operation: Operation::Subscribe,
                ..
            }
        ));
        assert!(session.subscribed_channels().is_empty());
    }

    #[tokio::test]
    async fn test_request_times_out_and_releases() {
        let config = BridgeConfig::configure(["general"], 50).unwrap();
        let bridge = ProtocolBridge::new(config, EventBus::local());
        let (mut session, mut rx) = bridge.open_session();

        session
            .handle(BridgeRequest::Request {
                id: 1,
                channel: "general".into(),
                body: "anyone?".into(),
                headers: BTreeMap::new(),
            })
            .await;
        assert_eq!(bridge.pending_requests(), 1);

        assert_eq!(
            next(&mut rx).await,
            BridgeEvent::RequestFailed {
                id: 1,
                reason: FailureReason::Timeout
            }
        );
        assert_eq!(bridge.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_gets_reply() {
        let bus = EventBus::local();
        let bridge = general_bridge(bus.clone());
        let (mut session, mut rx) = bridge.open_session();

        let responder_bus = bus.clone();
        let _responder = bus.subscribe(&Channel::parse("general").unwrap(), move |env| {
            if let Some(reply_to) = env.reply_to() {
                let channel = Channel::parse(reply_to).unwrap();
                responder_bus.publish(Envelope::chat(channel, "pong", "server", None));
            }
        });

        session
            .handle(BridgeRequest::Request {
                id: 9,
                channel: "general".into(),
                body: "ping".into(),
                headers: BTreeMap::new(),
            })
            .await;

        match next(&mut rx).await {
            BridgeEvent::Reply { id, body, headers } => {
                assert_eq!(id, 9);
                assert_eq!(body, "pong");
                assert_eq!(headers.get("handle").map(String::as_str), Some("server"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_frame_gets_generic_error() {
        let bridge = general_bridge(EventBus::local());
        let (mut session, mut rx) = bridge.open_session();

        session.handle_text("{not json").await;
        assert_eq!(
            next(&mut rx).await,
            BridgeEvent::Error {
                message: "invalid request".into()
            }
        );
    }

    #[tokio::test]
    async fn test_request_denied_outside_allowlist() {
        let bridge = general_bridge(EventBus::local());
        let (mut session, mut rx) = bridge.open_session();

        session
            .handle(BridgeRequest::Request {
                id: 3,
                channel: "other-channel".into(),
                body: "x".into(),
                headers: BTreeMap::new(),
            })
            .await;

        assert_eq!(
            next(&mut rx).await,
            BridgeEvent::RequestFailed {
                id: 3,
                reason: FailureReason::Denied
            }
        );
        assert_eq!(bridge.pending_requests(), 0);
    }
}
