//! TCP cluster transport
//!
//! A statically seeded full mesh. Every node listens on
//! `<cluster address>:<cluster port>` and keeps one outbound link to each
//! configured peer. Published envelopes are delivered locally and written
//! once to every connected outbound link; envelopes read from inbound links
//! are delivered locally only and never re-forwarded.
//!
//! Wire format: [4-byte BE length][JSON envelope]

use crate::channels::Channel;
use crate::cluster::envelope::Envelope;
use crate::cluster::local::LocalTransport;
use crate::cluster::transport::{ClusterTransport, EnvelopeSink, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_CLUSTER_PORT: u16 = 15701;

/// Frames larger than this are never sent; a peer sending one is dropped
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Per-peer outbound queue depth; envelopes beyond it are dropped
const LINK_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct TcpClusterConfig {
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
    /// Cluster endpoints of the other members
    pub peers: Vec<SocketAddr>,
    /// Initial delay before reconnecting to a peer
    pub reconnect_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_reconnect_delay: Duration,
}

impl TcpClusterConfig {
    pub fn new(port: u16, peers: Vec<SocketAddr>) -> Self {
        Self {
            port,
            peers,
            reconnect_delay: Duration::from_millis(250),
            max_reconnect_delay: Duration::from_secs(10),
        }
    }

    pub fn reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }
}

/// Cluster member speaking the TCP mesh protocol
pub struct TcpCluster {
    config: TcpClusterConfig,
    local: LocalTransport,
    /// Outbound queues for peers that currently have a live link
    links: Arc<DashMap<SocketAddr, mpsc::Sender<Envelope>>>,
    bound: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl TcpCluster {
    pub fn new(config: TcpClusterConfig) -> Self {
        Self {
            config,
            local: LocalTransport::new(),
            links: Arc::new(DashMap::new()),
            bound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Address the cluster listener is bound to, once joined
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    /// Number of peers with a live outbound link
    pub fn connected_peers(&self) -> usize {
        self.links.len()
    }

    /// Envelopes that never reached a peer: no live link, full queue,
    /// oversized, or lost with a failed link
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn remote_peers(&self) -> Vec<SocketAddr> {
        let own = self.local_addr();
        self.config
            .peers
            .iter()
            .copied()
            .filter(|peer| Some(*peer) != own)
            .collect()
    }
}

#[async_trait]
impl ClusterTransport for TcpCluster {
    async fn join_cluster(&self, address: IpAddr) -> Result<(), TransportError> {
        if let Some(addr) = self.local_addr() {
            return Err(TransportError::AlreadyJoined(addr));
        }

        let requested = SocketAddr::new(address, self.config.port);
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| TransportError::Bind {
                addr: requested,
                source,
            })?;
        let bound = listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                addr: requested,
                source,
            })?;
        *self.bound.lock() = Some(bound);

        info!(addr = %bound, peers = self.config.peers.len(), "Joined cluster");

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(accept_loop(listener, self.local.clone())));

        for peer in self.remote_peers() {
            tasks.push(tokio::spawn(peer_link(
                peer,
                self.config.clone(),
                self.links.clone(),
                self.dropped.clone(),
            )));
        }

        Ok(())
    }

    fn publish_raw(&self, envelope: Envelope) -> Result<(), TransportError> {
        let peers = self.remote_peers();
        let mut unreachable = 0;

        for peer in &peers {
            let sent = self
                .links
                .get(peer)
                .map(|link| link.try_send(envelope.clone()).is_ok())
                .unwrap_or(false);
            if !sent {
                debug!(peer = %peer, channel = %envelope.channel, "Peer link unavailable, dropping envelope");
                unreachable += 1;
            }
        }

        self.local.deliver(&envelope);

        if unreachable > 0 {
            self.dropped.fetch_add(unreachable as u64, Ordering::Relaxed);
            return Err(TransportError::Unreachable {
                unreachable,
                total: peers.len(),
            });
        }
        Ok(())
    }

    fn subscribe_raw(&self, channel: &Channel, sink: EnvelopeSink) -> Uuid {
        self.local.subscribe_raw(channel, sink)
    }

    fn unsubscribe_raw(&self, channel: &Channel, id: Uuid) {
        self.local.unsubscribe_raw(channel, id)
    }
}

impl Drop for TcpCluster {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, local: LocalTransport) {
    // Dropping the set with this task closes every inbound link
    let mut readers = JoinSet::new();

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(peer = %peer_addr, "Accepted cluster link");
                readers.spawn(read_link(stream, peer_addr, local.clone()));
            }
            Err(e) => {
                warn!(error = %e, "Cluster accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
        while readers.try_join_next().is_some() {}
    }
}

async fn read_link(mut stream: TcpStream, peer_addr: SocketAddr, local: LocalTransport) {
    loop {
        match read_frame(&mut stream).await {
            Ok(Some(envelope)) => {
                local.deliver(&envelope);
            }
            Ok(None) => {
                debug!(peer = %peer_addr, "Cluster link closed");
                break;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "Dropping cluster link");
                break;
            }
        }
    }
}

/// Maintain the outbound link to one peer, reconnecting with backoff
async fn peer_link(
    peer: SocketAddr,
    config: TcpClusterConfig,
    links: Arc<DashMap<SocketAddr, mpsc::Sender<Envelope>>>,
    dropped: Arc<AtomicU64>,
) {
    let mut attempt = 0u32;

    loop {
        match TcpStream::connect(peer).await {
            Ok(mut stream) => {
                info!(peer = %peer, "Connected to cluster peer");
                attempt = 0;

                let (tx, mut rx) = mpsc::channel::<Envelope>(LINK_QUEUE_DEPTH);
                links.insert(peer, tx);

                let mut lost = drive_link(peer, &mut stream, &mut rx, &dropped).await;

                links.remove(&peer);
                rx.close();
                while rx.try_recv().is_ok() {
                    lost += 1;
                }
                if lost > 0 {
                    dropped.fetch_add(lost, Ordering::Relaxed);
                    warn!(peer = %peer, lost, "Envelopes lost with cluster link");
                }
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, attempt = attempt + 1, "Cluster peer connect failed");
            }
        }

        let delay = std::cmp::min(
            config.reconnect_delay * 2u32.saturating_pow(attempt),
            config.max_reconnect_delay,
        );
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

/// Write queued envelopes until the link fails or the peer hangs up
///
/// Returns the number of envelopes lost in the failed write.
async fn drive_link(
    peer: SocketAddr,
    stream: &mut TcpStream,
    rx: &mut mpsc::Receiver<Envelope>,
    dropped: &AtomicU64,
) -> u64 {
    let (mut reader, mut writer) = stream.split();
    // Peers never write on an outbound link; any read result means it is gone
    let mut hangup = [0u8; 1];

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else {
                    return 0;
                };
                let frame = match encode_frame(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(peer = %peer, channel = %envelope.channel, error = %e, "Skipping envelope for cluster peer");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(&frame).await {
                    warn!(peer = %peer, error = %e, "Cluster peer write failed");
                    return 1;
                }
            }
            _ = reader.read(&mut hangup) => {
                debug!(peer = %peer, "Cluster peer hung up");
                return 0;
            }
        }
    }
}

/// Length-prefixed JSON frame for `envelope`
fn encode_frame(envelope: &Envelope) -> io::Result<Vec<u8>> {
    let data = serde_json::to_vec(envelope)?;
    if data.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("envelope too large: {} bytes", data.len()),
        ));
    }
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

/// Read one frame; `Ok(None)` on clean end of stream
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Option<Envelope>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    let envelope = serde_json::from_slice(&data)?;
    Ok(Some(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn general() -> Channel {
        Channel::parse("general").unwrap()
    }

    async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, envelope: &Envelope) -> io::Result<()> {
        writer.write_all(&encode_frame(envelope)?).await?;
        writer.flush().await
    }

    #[tokio::test]
    async fn test_frame_codec() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let env = Envelope::chat(general(), "hello", "bob", Some("abc="));

        write_frame(&mut a, &env).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(env));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_publish_without_peers_is_local_only() {
        let cluster = TcpCluster::new(TcpClusterConfig::new(0, Vec::new()));
        cluster
            .join_cluster("127.0.0.1".parse().unwrap())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        cluster.subscribe_raw(&general(), tx);
        cluster.publish_raw(Envelope::new(general(), "hi")).unwrap();

        assert_eq!(rx.recv().await.unwrap().body, "hi");
        assert_eq!(cluster.dropped(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_reported_but_local_delivery_happens() {
        let config = TcpClusterConfig::new(0, vec!["127.0.0.1:1".parse().unwrap()])
            .reconnect_delay(Duration::from_secs(60), Duration::from_secs(60));
        let cluster = TcpCluster::new(config);
        cluster
            .join_cluster("127.0.0.1".parse().unwrap())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        cluster.subscribe_raw(&general(), tx);

        let result = cluster.publish_raw(Envelope::new(general(), "hi"));
        assert!(matches!(
            result,
            Err(TransportError::Unreachable { unreachable: 1, total: 1 })
        ));
        assert_eq!(rx.recv().await.unwrap().body, "hi");
        assert_eq!(cluster.dropped(), 1);
    }

    #[tokio::test]
    async fn test_join_twice_fails() {
        let cluster = TcpCluster::new(TcpClusterConfig::new(0, Vec::new()));
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        cluster.join_cluster(addr).await.unwrap();
        assert!(matches!(
            cluster.join_cluster(addr).await,
            Err(TransportError::AlreadyJoined(_))
        ));
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Two joined members on loopback with live links both ways
    async fn linked_pair() -> (TcpCluster, TcpCluster) {
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let (port_a, port_b) = (free_port(), free_port());
        let node = |port: u16, peer: u16| {
            TcpCluster::new(
                TcpClusterConfig::new(port, vec![SocketAddr::new(loopback, peer)])
                    .reconnect_delay(Duration::from_millis(20), Duration::from_millis(100)),
            )
        };

        let a = node(port_a, port_b);
        let b = node(port_b, port_a);
        a.join_cluster(loopback).await.unwrap();
        b.join_cluster(loopback).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while a.connected_peers() == 0 || b.connected_peers() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peers linked");
        (a, b)
    }

    #[tokio::test]
    async fn test_oversized_envelope_skipped_link_survives() {
        let (a, b) = linked_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe_raw(&general(), tx);

        let huge = "x".repeat(2 * MAX_FRAME_LEN);
        a.publish_raw(Envelope::new(general(), huge)).unwrap();
        for i in 0..50 {
            a.publish_raw(Envelope::new(general(), i.to_string())).unwrap();
        }

        for i in 0..50 {
            let env = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("small envelope delivered")
                .unwrap();
            assert_eq!(env.body, i.to_string());
        }
        assert_eq!(a.dropped(), 1);
        assert_eq!(a.connected_peers(), 1);
    }

    #[tokio::test]
    async fn test_dropped_member_unlinks_from_peer() {
        let (a, b) = linked_pair().await;
        drop(a);

        tokio::time::timeout(Duration::from_secs(2), async {
            while b.connected_peers() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("link to the dropped member closed");

        let result = b.publish_raw(Envelope::new(general(), "anyone?"));
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }
}
