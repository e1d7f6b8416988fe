//! Cluster membership and transport
//!
//! - `address`: pick the local address this node advertises
//! - `transport`: the capability the bus core is written against
//! - `local`: in-process fan-out
//! - `tcp`: multi-process mesh over TCP

mod address;
mod envelope;
mod local;
mod tcp;
mod transport;

pub use address::{
    cluster_address, local_addresses, select_cluster_address, AddressError,
    DEFAULT_CLUSTER_PREFIX,
};
pub use envelope::{Envelope, HEADER_HANDLE, HEADER_REPLY_TO, HEADER_TOKEN};
pub use local::LocalTransport;
pub use tcp::{TcpCluster, TcpClusterConfig, DEFAULT_CLUSTER_PORT};
pub use transport::{ClusterTransport, EnvelopeSink, TransportError};
