//! Chatbus bridge client
//!
//! A WebSocket client for the chatbus protocol bridge: the same protocol the
//! browser chat page speaks, for services and tests written in Rust.
//!
//! # Example
//!
//! ```no_run
//! use chatbus_client::{ChatbusClient, ChatbusConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ChatbusConfig::new("ws://localhost:8080/eventbus").handle("web-alice");
//!     let client = ChatbusClient::new(config);
//!
//!     client.connect().await?;
//!     client.subscribe("general").await?;
//!     client.publish("general", "hello from the browser side").await?;
//!
//!     while let Some(message) = client.next_message().await {
//!         println!("[{}:{}] {}", message.channel, message.sender(), message.body);
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
mod messages;

pub use client::{ChatbusClient, ConnectionState};
pub use config::ChatbusConfig;
pub use error::ChatbusError;
pub use messages::{ChatMessage, ClientMessage, FailureReason, Operation, ServerMessage};
