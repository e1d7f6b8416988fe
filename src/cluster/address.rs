//! Cluster address selection
//!
//! A node advertises exactly one local address to the cluster. It is chosen
//! by string prefix (`192.168.1` by default) over every address bound to a
//! local interface. When several addresses match, the first one in
//! enumeration order wins; interface order is not stable across hosts, so
//! operators with multiple matching interfaces should tighten the prefix.

use std::io;
use std::net::IpAddr;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CLUSTER_PREFIX: &str = "192.168.1";

#[derive(Debug, Error)]
pub enum AddressError {
    #[error(
        "IP address with prefix '{prefix}' not found. Set --cluster-prefix \
         (or CHATBUS_CLUSTER_PREFIX) to the correct value for the current network"
    )]
    NoMatchingAddress { prefix: String },

    #[error("failed to enumerate local network interfaces: {0}")]
    InterfaceEnumeration(#[from] io::Error),
}

/// Pick the first address whose string form starts with `prefix`
pub fn select_cluster_address<I>(prefix: &str, addresses: I) -> Result<IpAddr, AddressError>
where
    I: IntoIterator<Item = IpAddr>,
{
    addresses
        .into_iter()
        .find(|addr| addr.to_string().starts_with(prefix))
        .ok_or_else(|| AddressError::NoMatchingAddress {
            prefix: prefix.to_string(),
        })
}

/// All addresses bound to local interfaces, in enumeration order
pub fn local_addresses() -> Result<Vec<IpAddr>, AddressError> {
    let addresses: Vec<IpAddr> = get_if_addrs::get_if_addrs()?
        .into_iter()
        .map(|iface| {
            debug!(interface = %iface.name, addr = %iface.ip(), "Found local address");
            iface.ip()
        })
        .collect();
    Ok(addresses)
}

/// Select the cluster address for this host
pub fn cluster_address(prefix: &str) -> Result<IpAddr, AddressError> {
    select_cluster_address(prefix, local_addresses()?)
}
