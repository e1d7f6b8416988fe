//! The chat bus core
//!
//! [`EventBus`] moves envelopes between channels and subscriptions without
//! knowing who sent them. [`ChatBusClient`] layers a sender identity on top:
//! it stamps the `handle`/`token` headers on publish and classifies
//! authenticity on delivery.

mod client;
mod event_bus;

pub use client::{
    AuthPolicy, BusError, ChatBusClient, ClientIdentity, ConsoleHandler, InboundMessage,
    LineHandler, MessageHandler, GENERAL_CHANNEL,
};
pub use event_bus::{EventBus, Subscription};
