//! Node configuration shared by the binaries
//!
//! Every setting can come from a flag or a `CHATBUS_*` environment variable;
//! binaries load `.env` first.

use crate::auth::{SharedSecret, TokenError, Verifier};
use crate::bus::{AuthPolicy, ChatBusClient, ClientIdentity, EventBus};
use crate::cluster::{
    cluster_address, AddressError, ClusterTransport, TcpCluster, TcpClusterConfig,
    TransportError, DEFAULT_CLUSTER_PORT, DEFAULT_CLUSTER_PREFIX,
};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("handle cannot be empty")]
    EmptyHandle,

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("failed to join cluster: {0}")]
    Join(#[from] TransportError),

    #[error("failed to sign handle: {0}")]
    Token(#[from] TokenError),
}

/// Cluster and identity settings for one node
#[derive(Debug, Clone, clap::Args)]
pub struct NodeConfig {
    /// Prefix of the local address to join the cluster on
    #[arg(long, env = "CHATBUS_CLUSTER_PREFIX", default_value = DEFAULT_CLUSTER_PREFIX)]
    pub cluster_prefix: String,

    /// Port for cluster links
    #[arg(long, env = "CHATBUS_CLUSTER_PORT", default_value_t = DEFAULT_CLUSTER_PORT)]
    pub cluster_port: u16,

    /// Cluster endpoint of another member (repeatable or comma-separated)
    #[arg(long = "peer", env = "CHATBUS_PEERS", value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    /// Shared secret used to sign and verify sender handles
    #[arg(long, env = "CHATBUS_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// Drop messages that carry no token
    #[arg(long, env = "CHATBUS_STRICT")]
    pub strict: bool,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl NodeConfig {
    pub fn shared_secret(&self) -> Option<SharedSecret> {
        self.secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(SharedSecret::new)
    }

    pub fn policy(&self) -> AuthPolicy {
        if self.strict {
            AuthPolicy::Strict
        } else {
            AuthPolicy::Permissive
        }
    }

    /// Identity for `handle`, signed when a secret is configured
    pub fn identity(&self, handle: &str) -> Result<ClientIdentity, ConfigError> {
        if handle.trim().is_empty() {
            return Err(ConfigError::EmptyHandle);
        }
        match self.shared_secret() {
            Some(secret) => Ok(ClientIdentity::signed(handle, &secret)?),
            None => {
                warn!(handle, "No shared secret configured, messages will be unsigned");
                Ok(ClientIdentity::unsigned(handle))
            }
        }
    }

    pub fn verifier(&self) -> Option<Verifier> {
        self.shared_secret().map(Verifier::new)
    }

    /// Select the cluster address and join the TCP mesh
    pub async fn join(&self) -> Result<EventBus, ConfigError> {
        let address = cluster_address(&self.cluster_prefix)?;
        info!(addr = %address, prefix = %self.cluster_prefix, "Selected cluster address");

        let cluster = TcpCluster::new(TcpClusterConfig::new(
            self.cluster_port,
            self.peers.clone(),
        ));
        cluster.join_cluster(address).await?;
        Ok(EventBus::new(Arc::new(cluster)))
    }

    /// A chat client on `bus` with this node's verification settings
    pub fn client(&self, bus: EventBus, identity: ClientIdentity) -> ChatBusClient {
        let client = ChatBusClient::new(bus, identity).with_policy(self.policy());
        match self.verifier() {
            Some(verifier) => client.with_verifier(verifier),
            None => client,
        }
    }
}

/// Install the global tracing subscriber, logging to stderr
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
