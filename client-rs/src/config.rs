//! Configuration for the chatbus bridge client

use std::time::Duration;

/// Configuration for connecting to a chatbus bridge
#[derive(Debug, Clone)]
pub struct ChatbusConfig {
    /// Bridge URL (e.g., "ws://localhost:8080/eventbus")
    pub url: String,

    /// Sent as the `handle` header on publishes and requests
    pub handle: Option<String>,

    /// Sent as the `token` header on publishes and requests
    pub token: Option<String>,

    /// Timeout for acknowledged operations (subscribe, publish, ping)
    pub operation_timeout: Duration,

    /// Upper bound on waiting for a request's reply; the bridge normally
    /// answers sooner with its own timeout
    pub request_timeout: Duration,
}

impl ChatbusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handle: None,
            token: None,
            operation_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
