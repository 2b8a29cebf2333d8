//! UDP transport.
//!
//! One frame per datagram. Dialing yields a connected socket. The listener
//! demultiplexes datagrams by source address: the first datagram from a new
//! peer produces an accepted connection, later ones feed its stream.

use crate::domain::TransportKind;
use crate::error::TransportError;
use crate::ports::{Connection, DialOptions, FrameSink, FrameStream, Listener, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Datagrams buffered per accepted peer before new ones are dropped.
const PEER_BACKLOG: usize = 256;

/// Peers awaiting `accept`.
const ACCEPT_BACKLOG: usize = 64;

/// How often peers whose context has gone away are forgotten.
const PEER_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Datagram transport.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    max_datagram_len: usize,
}

impl UdpTransport {
    /// Create a transport rejecting datagrams over `max_datagram_len` bytes.
    #[must_use]
    pub fn new(max_datagram_len: usize) -> Self {
        Self { max_datagram_len }
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn dial(&self, addr: SocketAddr, _options: &DialOptions) -> Result<Connection, TransportError> {
        let socket = UdpSocket::bind(unspecified_for(addr)).await?;
        socket.connect(addr).await?;
        debug!(remote = %addr, local = ?socket.local_addr().ok(), "UDP socket connected");

        let socket = Arc::new(socket);
        Ok(Connection::new(
            addr,
            UdpSink {
                socket: Arc::clone(&socket),
                target: None,
                max_datagram_len: self.max_datagram_len,
            },
            ConnectedStream {
                socket,
                buf: vec![0u8; self.max_datagram_len],
            },
        ))
    }

    async fn bind(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let demux = tokio::spawn(demultiplex(
            Arc::clone(&socket),
            accept_tx,
            self.max_datagram_len,
        ));

        Ok(Box::new(UdpListener {
            local_addr,
            accepted: accept_rx,
            demux: Some(demux),
        }))
    }
}

/// Route datagrams from the shared socket to per-peer streams.
async fn demultiplex(
    socket: Arc<UdpSocket>,
    accept_tx: mpsc::Sender<Connection>,
    max_datagram_len: usize,
) {
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; max_datagram_len];
    let mut sweep = tokio::time::interval(PEER_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = sweep.tick() => {
                let forgotten = prune_closed(&mut peers);
                if forgotten > 0 {
                    trace!(forgotten, "Closed UDP peers pruned");
                }
                continue;
            }
        };
        let (len, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms
                trace!(error = %e, "UDP receive error ignored");
                continue;
            }
        };
        let frame = Bytes::copy_from_slice(&buf[..len]);

        if let Some(tx) = peers.get(&peer) {
            match tx.try_send(frame.clone()) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(peer = %peer, "UDP peer backlog full, datagram dropped");
                    continue;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    peers.remove(&peer);
                }
            }
        }

        let (tx, rx) = mpsc::channel(PEER_BACKLOG);
        let _ = tx.try_send(frame);
        let conn = Connection::new(
            peer,
            UdpSink {
                socket: Arc::clone(&socket),
                target: Some(peer),
                max_datagram_len,
            },
            PeerStream { rx },
        );

        if accept_tx.send(conn).await.is_err() {
            return;
        }
        debug!(peer = %peer, "UDP peer accepted");
        peers.insert(peer, tx);
    }
}

/// Drop peers whose stream has been released. Returns how many went.
fn prune_closed(peers: &mut HashMap<SocketAddr, mpsc::Sender<Bytes>>) -> usize {
    let before = peers.len();
    peers.retain(|_, tx| !tx.is_closed());
    before - peers.len()
}

struct UdpSink {
    socket: Arc<UdpSocket>,
    /// Destination for unconnected (listener-side) sockets.
    target: Option<SocketAddr>,
    max_datagram_len: usize,
}

#[async_trait]
impl FrameSink for UdpSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > self.max_datagram_len {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_datagram_len,
            });
        }
        match self.target {
            Some(peer) => self.socket.send_to(&frame, peer).await?,
            None => self.socket.send(&frame).await?,
        };
        Ok(())
    }
}

struct ConnectedStream {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
}

#[async_trait]
impl FrameStream for ConnectedStream {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        let len = self.socket.recv(&mut self.buf).await?;
        Ok(Some(Bytes::copy_from_slice(&self.buf[..len])))
    }
}

struct PeerStream {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameStream for PeerStream {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

struct UdpListener {
    local_addr: SocketAddr,
    accepted: mpsc::Receiver<Connection>,
    demux: Option<JoinHandle<()>>,
}

#[async_trait]
impl Listener for UdpListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&mut self) -> Result<Connection, TransportError> {
        self.accepted.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) {
        if let Some(demux) = self.demux.take() {
            demux.abort();
            let _ = demux.await;
            self.accepted.close();
            debug!(local = %self.local_addr, "UDP listener closed");
        }
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        if let Some(demux) = self.demux.take() {
            demux.abort();
        }
    }
}
