//! # Stream Transport
//!
//! The networking layer assumes a reliable, authenticated, multiplexed stream
//! transport and only specifies what runs on top of it. This module defines
//! that assumption as the [`Transport`] trait and provides two implementations:
//!
//! | Transport | Use |
//! |-----------|-----|
//! | [`MemoryTransport`] | in-process peers over `tokio::io::duplex`, used by tests and simulations |
//! | [`TcpTransport`] | one TCP connection per stream with a small negotiation preamble |
//!
//! ## Negotiation
//!
//! The dialer proposes protocol ids in priority order; the first id the
//! remote registered is selected. This is where RPC version fallback happens:
//! the request/response engine lists `[V2, V1]` and the transport picks
//! whatever the remote understands.
//!
//! TCP preamble, per stream:
//!
//! ```text
//! dialer  -> hello(peer_id 32 bytes, listen_port u16 BE)
//! listener-> hello(peer_id 32 bytes, listen_port u16 BE)
//! dialer  -> "<protocol id>\n"     (repeated)
//! listener-> "<protocol id>\n" | "na\n"
//! ```
//!
//! Inbound streams and connection changes are reported on the
//! [`TransportEvent`] channel returned when the transport is created.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::identity::PeerId;
use crate::messages::GossipFrame;
use crate::protocols::{GOSSIP_PROTOCOL_ID, GossipSender};

/// Buffer size of each in-memory pipe direction.
const MEMORY_PIPE_CAPACITY: usize = 256 * 1024;

/// Capacity of the transport event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Longest protocol line accepted during negotiation.
const MAX_PROTOCOL_LINE: usize = 256;

/// Time allowed for the TCP preamble.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

const NA: &str = "na";

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("no protocol in {0:?} is supported by the remote")]
    UnsupportedProtocol(Vec<String>),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct InboundStream {
    pub peer: PeerId,
    pub protocol: String,
    pub stream: BoxStream,
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    PeerConnected { peer: PeerId, outbound: bool },
    PeerDisconnected { peer: PeerId },
    Inbound(InboundStream),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_peer(&self) -> PeerId;

    /// Opens a stream to `peer` using the first of `protocols` it supports.
    async fn open_stream(
        &self,
        peer: &PeerId,
        protocols: &[String],
    ) -> Result<(String, BoxStream), TransportError>;

    async fn disconnect(&self, peer: &PeerId);

    fn connected_peers(&self) -> Vec<PeerId>;
}

// ============================================================================
// Memory Transport
// ============================================================================

struct MemoryPeer {
    protocols: HashSet<String>,
    events: mpsc::Sender<TransportEvent>,
    connected: HashSet<PeerId>,
}

/// In-process hub connecting [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<PeerId, MemoryPeer>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer that accepts `protocols`.
    pub fn join(
        &self,
        peer: PeerId,
        protocols: impl IntoIterator<Item = String>,
    ) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.peers.lock().insert(
            peer,
            MemoryPeer {
                protocols: protocols.into_iter().collect(),
                events: tx,
                connected: HashSet::new(),
            },
        );
        (
            MemoryTransport {
                local: peer,
                network: self.clone(),
            },
            rx,
        )
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Marks both sides connected and reports it on both event channels.
    pub async fn connect(&self, peer: &PeerId) -> Result<(), TransportError> {
        let (local_tx, remote_tx) = {
            let mut peers = self.network.peers.lock();
            if !peers.contains_key(peer) || *peer == self.local {
                return Err(TransportError::Unreachable(*peer));
            }
            let newly = peers
                .get_mut(&self.local)
                .map(|p| p.connected.insert(*peer))
                .ok_or(TransportError::Closed)?;
            if !newly {
                return Ok(());
            }
            let remote = peers.get_mut(peer).ok_or(TransportError::Unreachable(*peer))?;
            remote.connected.insert(self.local);
            let remote_tx = remote.events.clone();
            let local_tx = peers.get(&self.local).map(|p| p.events.clone());
            (local_tx, remote_tx)
        };

        if let Some(tx) = local_tx {
            let _ = tx
                .send(TransportEvent::PeerConnected {
                    peer: *peer,
                    outbound: true,
                })
                .await;
        }
        let _ = remote_tx
            .send(TransportEvent::PeerConnected {
                peer: self.local,
                outbound: false,
            })
            .await;
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocols: &[String],
    ) -> Result<(String, BoxStream), TransportError> {
        self.connect(peer).await?;

        let (selected, remote_tx) = {
            let peers = self.network.peers.lock();
            let remote = peers.get(peer).ok_or(TransportError::Unreachable(*peer))?;
            let selected = protocols
                .iter()
                .find(|p| remote.protocols.contains(*p))
                .cloned()
                .ok_or_else(|| TransportError::UnsupportedProtocol(protocols.to_vec()))?;
            (selected, remote.events.clone())
        };

        let (local, remote) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        remote_tx
            .send(TransportEvent::Inbound(InboundStream {
                peer: self.local,
                protocol: selected.clone(),
                stream: Box::new(remote),
            }))
            .await
            .map_err(|_| TransportError::Unreachable(*peer))?;
        trace!(peer = %peer.short(), protocol = %selected, "memory stream opened");
        Ok((selected, Box::new(local)))
    }

    async fn disconnect(&self, peer: &PeerId) {
        let senders = {
            let mut peers = self.network.peers.lock();
            let was_connected = peers
                .get_mut(&self.local)
                .is_some_and(|p| p.connected.remove(peer));
            if !was_connected {
                return;
            }
            if let Some(remote) = peers.get_mut(peer) {
                remote.connected.remove(&self.local);
            }
            [
                peers.get(&self.local).map(|p| (p.events.clone(), *peer)),
                peers.get(peer).map(|p| (p.events.clone(), self.local)),
            ]
        };
        for (tx, gone) in senders.into_iter().flatten() {
            let _ = tx.send(TransportEvent::PeerDisconnected { peer: gone }).await;
        }
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.network
            .peers
            .lock()
            .get(&self.local)
            .map(|p| p.connected.iter().copied().collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// TCP Transport
// ============================================================================

struct TcpShared {
    local: PeerId,
    listen_port: u16,
    protocols: HashSet<String>,
    addresses: Mutex<HashMap<PeerId, SocketAddr>>,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Clone)]
pub struct TcpTransport {
    shared: Arc<TcpShared>,
}

impl TcpTransport {
    /// Binds `addr` and starts accepting streams until `cancel` fires.
    pub async fn bind(
        addr: SocketAddr,
        local: PeerId,
        protocols: impl IntoIterator<Item = String>,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(TcpShared {
            local,
            listen_port: local_addr.port(),
            protocols: protocols.into_iter().collect(),
            addresses: Mutex::new(HashMap::new()),
            events: tx,
        });

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let shared = accept_shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = accept_stream(shared, stream, remote).await {
                                    debug!(remote = %remote, error = %e, "inbound stream rejected");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
            debug!("tcp accept loop stopped");
        });

        Ok((Self { shared }, rx))
    }

    pub fn listen_port(&self) -> u16 {
        self.shared.listen_port
    }

    /// Connects to `addr`, learns the remote peer id, and records its address.
    pub async fn dial(&self, addr: SocketAddr) -> Result<PeerId, TransportError> {
        let mut stream = TcpStream::connect(addr).await?;
        let peer = tokio::time::timeout(
            NEGOTIATION_TIMEOUT,
            exchange_hello(&mut stream, self.shared.local, self.shared.listen_port),
        )
        .await
        .map_err(|_| TransportError::Negotiation("hello timed out".into()))??
        .0;
        // Closing without a proposal ends the remote's negotiation.
        drop(stream);
        self.record_peer(peer, addr, true).await;
        Ok(peer)
    }

    async fn record_peer(&self, peer: PeerId, addr: SocketAddr, outbound: bool) {
        record_peer(&self.shared, peer, addr, outbound).await;
    }
}

async fn record_peer(shared: &TcpShared, peer: PeerId, addr: SocketAddr, outbound: bool) {
    let previous = shared.addresses.lock().insert(peer, addr);
    if previous.is_none() {
        let _ = shared
            .events
            .send(TransportEvent::PeerConnected { peer, outbound })
            .await;
    }
}

async fn exchange_hello(
    stream: &mut TcpStream,
    local: PeerId,
    listen_port: u16,
) -> Result<(PeerId, u16), TransportError> {
    let mut hello = [0u8; 34];
    hello[..32].copy_from_slice(local.as_bytes());
    hello[32..].copy_from_slice(&listen_port.to_be_bytes());
    stream.write_all(&hello).await?;

    let mut remote = [0u8; 34];
    stream.read_exact(&mut remote).await?;
    let mut id = [0u8; 32];
    id.copy_from_slice(&remote[..32]);
    let peer = PeerId::from_bytes(id);
    if !peer.is_valid() {
        return Err(TransportError::Negotiation("invalid peer id".into()));
    }
    Ok((peer, u16::from_be_bytes([remote[32], remote[33]])))
}

async fn read_line<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<String>, TransportError> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if r.read(&mut byte).await? == 0 {
            return Ok(None);
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_PROTOCOL_LINE {
            return Err(TransportError::Negotiation("protocol line too long".into()));
        }
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| TransportError::Negotiation("protocol line is not utf-8".into()))
}

async fn write_line<W: AsyncWrite + Unpin>(w: &mut W, line: &str) -> Result<(), TransportError> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await?;
    Ok(())
}

async fn accept_stream(
    shared: Arc<TcpShared>,
    mut stream: TcpStream,
    remote: SocketAddr,
) -> Result<(), TransportError> {
    let negotiated = tokio::time::timeout(NEGOTIATION_TIMEOUT, async {
        let (peer, port) = exchange_hello(&mut stream, shared.local, shared.listen_port).await?;
        record_peer(&shared, peer, SocketAddr::new(remote.ip(), port), false).await;
        loop {
            let Some(proposal) = read_line(&mut stream).await? else {
                return Ok::<_, TransportError>(None);
            };
            if shared.protocols.contains(&proposal) {
                write_line(&mut stream, &proposal).await?;
                return Ok(Some((peer, proposal)));
            }
            write_line(&mut stream, NA).await?;
        }
    })
    .await
    .map_err(|_| TransportError::Negotiation("negotiation timed out".into()))??;

    if let Some((peer, protocol)) = negotiated {
        shared
            .events
            .send(TransportEvent::Inbound(InboundStream {
                peer,
                protocol,
                stream: Box::new(stream),
            }))
            .await
            .map_err(|_| TransportError::Closed)?;
    }
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer(&self) -> PeerId {
        self.shared.local
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocols: &[String],
    ) -> Result<(String, BoxStream), TransportError> {
        let addr = self
            .shared
            .addresses
            .lock()
            .get(peer)
            .copied()
            .ok_or(TransportError::Unreachable(*peer))?;

        let mut stream = TcpStream::connect(addr).await?;
        let selected = tokio::time::timeout(NEGOTIATION_TIMEOUT, async {
            let (remote, _) =
                exchange_hello(&mut stream, self.shared.local, self.shared.listen_port).await?;
            if remote != *peer {
                return Err(TransportError::Negotiation(format!(
                    "expected {}, connected to {}",
                    peer.short(),
                    remote.short()
                )));
            }
            for proposal in protocols {
                write_line(&mut stream, proposal).await?;
                match read_line(&mut stream).await? {
                    Some(answer) if answer == *proposal => return Ok(proposal.clone()),
                    Some(answer) if answer == NA => continue,
                    Some(other) => {
                        return Err(TransportError::Negotiation(format!(
                            "unexpected answer {other:?}"
                        )));
                    }
                    None => break,
                }
            }
            Err(TransportError::UnsupportedProtocol(protocols.to_vec()))
        })
        .await
        .map_err(|_| TransportError::Negotiation("negotiation timed out".into()))??;

        Ok((selected, Box::new(stream)))
    }

    async fn disconnect(&self, peer: &PeerId) {
        let removed = self.shared.addresses.lock().remove(peer).is_some();
        if removed {
            let _ = self
                .shared
                .events
                .send(TransportEvent::PeerDisconnected { peer: *peer })
                .await;
        }
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.addresses.lock().keys().copied().collect()
    }
}

// ============================================================================
// Gossip over Transport Streams
// ============================================================================

/// [`GossipSender`] keeping one long-lived gossip stream per peer.
pub struct StreamGossipSender {
    transport: Arc<dyn Transport>,
    streams: Mutex<HashMap<PeerId, Arc<tokio::sync::Mutex<BoxStream>>>>,
}

impl StreamGossipSender {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            streams: Mutex::new(HashMap::new()),
        }
    }

    async fn stream_for(&self, to: &PeerId) -> Result<Arc<tokio::sync::Mutex<BoxStream>>> {
        if let Some(stream) = self.streams.lock().get(to).cloned() {
            return Ok(stream);
        }
        let (_, stream) = self
            .transport
            .open_stream(to, &[GOSSIP_PROTOCOL_ID.to_string()])
            .await?;
        let stream = Arc::new(tokio::sync::Mutex::new(stream));
        self.streams.lock().insert(*to, stream.clone());
        Ok(stream)
    }

    /// Drops the cached stream for a departed peer.
    pub fn forget(&self, peer: &PeerId) {
        self.streams.lock().remove(peer);
    }
}

#[async_trait]
impl GossipSender for StreamGossipSender {
    async fn send_gossip(&self, to: &PeerId, frame: GossipFrame) -> Result<()> {
        for attempt in 0..2 {
            let stream = self.stream_for(to).await?;
            let written = {
                let mut guard = stream.lock().await;
                codec::write_gossip_frame(&mut *guard, &frame).await
            };
            match written {
                Ok(()) => return Ok(()),
                Err(e) if attempt == 0 => {
                    trace!(peer = %to.short(), error = %e, "gossip stream broken, reopening");
                    self.forget(to);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Reads gossip frames from an inbound stream until it closes.
pub async fn read_gossip_stream<F>(peer: PeerId, mut stream: BoxStream, mut on_frame: F)
where
    F: FnMut(PeerId, GossipFrame) -> bool,
{
    loop {
        match codec::read_gossip_frame(&mut stream).await {
            Ok(frame) => {
                if !on_frame(peer, frame) {
                    break;
                }
            }
            Err(e) => {
                trace!(peer = %peer.short(), error = %e, "gossip stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    #[tokio::test]
    async fn memory_negotiation_picks_first_supported() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = net.join(peer(1), vec!["/p/2".to_string(), "/p/1".to_string()]);
        let (_b, mut b_rx) = net.join(peer(2), vec!["/p/1".to_string()]);

        let (selected, mut stream) = a
            .open_stream(&peer(2), &["/p/2".to_string(), "/p/1".to_string()])
            .await
            .expect("negotiated");
        assert_eq!(selected, "/p/1");
        stream.write_all(b"hi").await.expect("write");

        assert!(matches!(
            a_rx.recv().await,
            Some(TransportEvent::PeerConnected { outbound: true, .. })
        ));
        assert!(matches!(
            b_rx.recv().await,
            Some(TransportEvent::PeerConnected { outbound: false, .. })
        ));
        match b_rx.recv().await {
            Some(TransportEvent::Inbound(mut inbound)) => {
                assert_eq!(inbound.peer, peer(1));
                assert_eq!(inbound.protocol, "/p/1");
                let mut buf = [0u8; 2];
                inbound.stream.read_exact(&mut buf).await.expect("read");
                assert_eq!(&buf, b"hi");
            }
            other => panic!("expected inbound stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn memory_unsupported_protocol() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.join(peer(1), Vec::new());
        let (_b, _b_rx) = net.join(peer(2), vec!["/p/1".to_string()]);
        let result = a.open_stream(&peer(2), &["/p/3".to_string()]).await;
        assert!(matches!(result, Err(TransportError::UnsupportedProtocol(_))));
        assert!(matches!(
            a.open_stream(&peer(9), &["/p/1".to_string()]).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn memory_disconnect_notifies_both_sides() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = net.join(peer(1), Vec::new());
        let (b, mut b_rx) = net.join(peer(2), Vec::new());
        a.connect(&peer(2)).await.expect("connect");
        assert_eq!(a.connected_peers(), vec![peer(2)]);
        assert_eq!(b.connected_peers(), vec![peer(1)]);

        a.disconnect(&peer(2)).await;
        assert!(a.connected_peers().is_empty());
        assert!(b.connected_peers().is_empty());

        let _ = a_rx.recv().await;
        assert!(matches!(
            a_rx.recv().await,
            Some(TransportEvent::PeerDisconnected { .. })
        ));
        let _ = b_rx.recv().await;
        assert!(matches!(
            b_rx.recv().await,
            Some(TransportEvent::PeerDisconnected { .. })
        ));
    }

    #[tokio::test]
    async fn tcp_negotiation_and_fallback() {
        let cancel = CancellationToken::new();
        let any: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let (server, mut server_rx) = TcpTransport::bind(
            any,
            peer(1),
            vec!["/p/1".to_string()],
            cancel.clone(),
        )
        .await
        .expect("bind");
        let (client, _client_rx) = TcpTransport::bind(any, peer(2), Vec::new(), cancel.clone())
            .await
            .expect("bind");

        let server_addr: SocketAddr = format!("127.0.0.1:{}", server.listen_port())
            .parse()
            .expect("addr");
        assert_eq!(client.dial(server_addr).await.expect("dial"), peer(1));

        let (selected, mut stream) = client
            .open_stream(&peer(1), &["/p/2".to_string(), "/p/1".to_string()])
            .await
            .expect("negotiated");
        assert_eq!(selected, "/p/1");
        stream.write_all(b"ok").await.expect("write");

        let inbound = loop {
            match tokio::time::timeout(Duration::from_secs(5), server_rx.recv())
                .await
                .expect("event in time")
            {
                Some(TransportEvent::Inbound(inbound)) => break inbound,
                Some(_) => continue,
                None => panic!("transport closed"),
            }
        };
        assert_eq!(inbound.peer, peer(2));
        let mut inbound_stream = inbound.stream;
        let mut buf = [0u8; 2];
        inbound_stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ok");

        assert!(matches!(
            client.open_stream(&peer(1), &["/p/9".to_string()]).await,
            Err(TransportError::UnsupportedProtocol(_))
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn gossip_sender_reuses_stream() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.join(peer(1), Vec::new());
        let (_b, mut b_rx) = net.join(peer(2), vec![GOSSIP_PROTOCOL_ID.to_string()]);
        let sender = StreamGossipSender::new(Arc::new(a));

        for topic in ["x", "y"] {
            sender
                .send_gossip(&peer(2), GossipFrame::Subscribe { topic: topic.into() })
                .await
                .expect("send");
        }

        let _connected = b_rx.recv().await;
        let Some(TransportEvent::Inbound(inbound)) = b_rx.recv().await else {
            panic!("expected inbound gossip stream");
        };
        let mut frames = Vec::new();
        let mut stream = inbound.stream;
        for _ in 0..2 {
            frames.push(codec::read_gossip_frame(&mut stream).await.expect("frame"));
        }
        assert_eq!(
            frames,
            vec![
                GossipFrame::Subscribe { topic: "x".into() },
                GossipFrame::Subscribe { topic: "y".into() },
            ]
        );
    }
}
