//! Chat client: signed publishing and verified delivery

use crate::auth::{Authenticity, SharedSecret, TokenError, TokenSigner, Verifier};
use crate::bus::event_bus::{EventBus, Subscription};
use crate::channels::Channel;
use crate::cluster::{Envelope, HEADER_REPLY_TO};
use parking_lot::Mutex;
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, info, warn};

/// The channel every chat participant joins
pub const GENERAL_CHANNEL: &str = "general";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message has no reply address")]
    NoReplyAddress,

    #[error("invalid reply address: {0}")]
    InvalidReplyAddress(String),
}

/// Who a client publishes as
///
/// Fixed at construction; a client never changes handle or token.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    handle: String,
    token: Option<String>,
}

impl ClientIdentity {
    /// Identity whose messages carry a token for `handle`
    pub fn signed(handle: impl Into<String>, secret: &SharedSecret) -> Result<Self, TokenError> {
        let handle = handle.into();
        let token = TokenSigner::sign(secret, &handle)?;
        Ok(Self {
            handle,
            token: Some(token),
        })
    }

    /// Identity whose messages carry only the handle
    pub fn unsigned(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            token: None,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// What to do with messages that carry no token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthPolicy {
    /// Deliver, flagged as [`Authenticity::Unsigned`]
    #[default]
    Permissive,
    /// Drop
    Strict,
}

/// A message as seen by a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel: Channel,
    /// Value of the `handle` header, empty if absent
    pub sender: String,
    pub body: String,
    pub token: Option<String>,
    pub reply_to: Option<String>,
    pub authenticity: Authenticity,
}

pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: &InboundMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(&InboundMessage) + Send + Sync + 'static,
{
    fn on_message(&self, message: &InboundMessage) {
        self(message)
    }
}

/// Writes `[channel:sender] body` lines
pub struct LineHandler<W> {
    out: Mutex<W>,
}

/// The default display handler, writing to stdout
pub type ConsoleHandler = LineHandler<io::Stdout>;

impl<W: Write + Send + 'static> LineHandler<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn format(message: &InboundMessage) -> String {
        format!("[{}:{}] {}", message.channel, message.sender, message.body)
    }
}

impl ConsoleHandler {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send + 'static> MessageHandler for LineHandler<W> {
    fn on_message(&self, message: &InboundMessage) {
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{}", Self::format(message)).and_then(|_| out.flush()) {
            warn!(error = %e, "Failed to write chat line");
        }
    }
}

/// A chat participant on the bus
#[derive(Clone)]
pub struct ChatBusClient {
    bus: EventBus,
    identity: ClientIdentity,
    verifier: Option<Verifier>,
    policy: AuthPolicy,
}

impl ChatBusClient {
    pub fn new(bus: EventBus, identity: ClientIdentity) -> Self {
        Self {
            bus,
            identity,
            verifier: None,
            policy: AuthPolicy::default(),
        }
    }

    /// Check sender tokens on every delivered message
    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_policy(mut self, policy: AuthPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn handle(&self) -> &str {
        self.identity.handle()
    }

    /// Publish `body` to every subscriber of `channel`
    ///
    /// Returns once the message is handed to the transport.
    pub fn publish(&self, channel: &Channel, body: impl Into<String>) {
        let body = body.into();
        debug!(channel = %channel, handle = %self.identity.handle, "Sending message");
        self.bus.publish(self.envelope(channel, body));
    }

    /// Publish `body` to the reply address of `message`
    pub fn reply(&self, message: &InboundMessage, body: impl Into<String>) -> Result<(), BusError> {
        let reply_to = message.reply_to.as_deref().ok_or(BusError::NoReplyAddress)?;
        let channel = Channel::parse(reply_to)
            .map_err(|e| BusError::InvalidReplyAddress(e.to_string()))?;
        self.bus.publish(self.envelope(&channel, body.into()));
        Ok(())
    }

    /// Publish and ask for a reply on `reply_to`
    pub fn publish_with_reply(&self, channel: &Channel, body: impl Into<String>, reply_to: &Channel) {
        let envelope = self
            .envelope(channel, body.into())
            .with_header(HEADER_REPLY_TO, reply_to.as_str());
        self.bus.publish(envelope);
    }

    fn envelope(&self, channel: &Channel, body: String) -> Envelope {
        if self.identity.token.is_none() {
            warn!(handle = %self.identity.handle, "Signature token is not set");
        }
        Envelope::chat(
            channel.clone(),
            body,
            &self.identity.handle,
            self.identity.token(),
        )
    }

    /// Deliver every message on `channel` to `handler`
    pub fn subscribe<H: MessageHandler>(&self, channel: &Channel, handler: H) -> Subscription {
        info!(handle = %self.identity.handle, channel = %channel, "Subscribing to channel");

        let verifier = self.verifier.clone();
        let policy = self.policy;
        self.bus.subscribe(channel, move |envelope| {
            if let Some(message) = admit(envelope, verifier.as_ref(), policy) {
                handler.on_message(&message);
            }
        })
    }

    /// Subscribe with the console display handler
    pub fn subscribe_default(&self, channel: &Channel) -> Subscription {
        self.subscribe(channel, ConsoleHandler::stdout())
    }
}

/// Classify an envelope and decide whether it reaches the handler
fn admit(
    envelope: Envelope,
    verifier: Option<&Verifier>,
    policy: AuthPolicy,
) -> Option<InboundMessage> {
    let sender = envelope.handle().unwrap_or_default().to_string();
    let authenticity = match verifier {
        Some(verifier) => verifier.check(&sender, envelope.token()),
        None => Authenticity::Unchecked,
    };

    match (authenticity, policy) {
        (Authenticity::Forged, _) => {
            warn!(channel = %envelope.channel, sender = %sender, "Dropping message with invalid token");
            return None;
        }
        (Authenticity::Unsigned, AuthPolicy::Strict) => {
            warn!(channel = %envelope.channel, sender = %sender, "Dropping unsigned message");
            return None;
        }
        (Authenticity::Unsigned, AuthPolicy::Permissive) => {
            debug!(channel = %envelope.channel, sender = %sender, "Delivering unauthenticated message");
        }
        _ => {}
    }

    let token = envelope.token().map(str::to_string);
    let reply_to = envelope.reply_to().map(str::to_string);
    Some(InboundMessage {
        channel: envelope.channel,
        sender,
        body: envelope.body,
        token,
        reply_to,
        authenticity,
    })
}
