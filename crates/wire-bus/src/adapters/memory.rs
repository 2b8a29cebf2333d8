//! In-process transport.
//!
//! Connections are pairs of bounded channels routed through a shared hub.
//! The hub records dial attempts and lifecycle events and can refuse dials
//! or sever live connections, which makes connection loss and reconnection
//! reproducible under paused time.

use crate::domain::TransportKind;
use crate::error::TransportError;
use crate::ports::{Connection, DialOptions, FrameSink, FrameStream, Listener, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

/// Frames buffered per direction.
const CHANNEL_CAPACITY: usize = 1024;

/// First port handed out for `:0` binds and dialing peers.
const FIRST_EPHEMERAL_PORT: u16 = 40_000;

/// Entries kept per hub log; the oldest are dropped first.
pub const LOG_CAPACITY: usize = 4096;

/// Lifecycle events recorded by the hub, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemEvent {
    /// A listener accepted `peer`.
    Accepted {
        /// Listener address.
        listener: SocketAddr,
        /// Dialing peer.
        peer: SocketAddr,
    },
    /// The accepted side of a connection was released.
    ConnectionClosed {
        /// Listener address.
        listener: SocketAddr,
        /// Dialing peer.
        peer: SocketAddr,
    },
    /// A listener was closed.
    ListenerClosed(SocketAddr),
}

#[derive(Default)]
struct Hub {
    listeners: HashMap<SocketAddr, mpsc::Sender<Connection>>,
    refused: HashSet<SocketAddr>,
    links: HashMap<SocketAddr, Vec<watch::Sender<bool>>>,
    dial_attempts: VecDeque<(SocketAddr, Instant)>,
    events: VecDeque<MemEvent>,
    next_port: u16,
}

fn record<T>(log: &mut VecDeque<T>, entry: T) {
    if log.len() == LOG_CAPACITY {
        log.pop_front();
    }
    log.push_back(entry);
}

impl Hub {
    fn record_event(&mut self, event: MemEvent) {
        record(&mut self.events, event);
    }

    fn ephemeral_addr(&mut self) -> SocketAddr {
        if self.next_port < FIRST_EPHEMERAL_PORT {
            self.next_port = FIRST_EPHEMERAL_PORT;
        }
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1);
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }
}

/// In-process transport with fault injection.
///
/// Clones share the same hub.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Mutex<Hub>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hub = self.hub.lock();
        f.debug_struct("MemoryTransport")
            .field("listeners", &hub.listeners.len())
            .field("refused", &hub.refused)
            .finish()
    }
}

impl MemoryTransport {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every dial to `addr` with `ConnectionRefused`.
    pub fn refuse(&self, addr: SocketAddr) {
        self.hub.lock().refused.insert(addr);
    }

    /// Undo [`refuse`](Self::refuse).
    pub fn restore(&self, addr: SocketAddr) {
        self.hub.lock().refused.remove(&addr);
    }

    /// Drop every live connection to the listener at `addr`.
    ///
    /// Both ends observe a connection reset.
    pub fn sever(&self, addr: SocketAddr) -> usize {
        let links = self.hub.lock().links.remove(&addr).unwrap_or_default();
        let mut severed = 0;
        for link in links {
            if link.send(true).is_ok() {
                severed += 1;
            }
        }
        debug!(listener = %addr, severed, "Severed in-memory connections");
        severed
    }

    /// Instants of the dial attempts towards `addr`.
    ///
    /// Only the latest [`LOG_CAPACITY`] attempts across all addresses are kept.
    #[must_use]
    pub fn dial_attempts(&self, addr: SocketAddr) -> Vec<Instant> {
        self.hub
            .lock()
            .dial_attempts
            .iter()
            .filter(|(target, _)| *target == addr)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Recorded lifecycle events, oldest first, capped at [`LOG_CAPACITY`].
    #[must_use]
    pub fn events(&self) -> Vec<MemEvent> {
        self.hub.lock().events.iter().cloned().collect()
    }

    /// Forget recorded dial attempts and events.
    pub fn clear_logs(&self) {
        let mut hub = self.hub.lock();
        hub.dial_attempts.clear();
        hub.events.clear();
    }

    /// Whether a listener is bound at `addr`.
    #[must_use]
    pub fn is_listening(&self, addr: SocketAddr) -> bool {
        self.hub.lock().listeners.contains_key(&addr)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mem
    }

    async fn dial(&self, addr: SocketAddr, _options: &DialOptions) -> Result<Connection, TransportError> {
        let refused = || TransportError::ConnectionRefused {
            remote: addr.to_string(),
        };

        let mut hub = self.hub.lock();
        record(&mut hub.dial_attempts, (addr, Instant::now()));
        if hub.refused.contains(&addr) {
            return Err(refused());
        }
        let accept_tx = hub.listeners.get(&addr).cloned().ok_or_else(refused)?;

        let peer = hub.ephemeral_addr();
        let (link_tx, link_rx) = watch::channel(false);
        let (to_server, from_client) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_client, from_server) = mpsc::channel(CHANNEL_CAPACITY);

        let server_side = Connection::new(
            peer,
            MemSink {
                tx: to_client,
                link: link_rx.clone(),
                accepted: Some((Arc::clone(&self.hub), addr, peer)),
            },
            MemStream {
                rx: from_client,
                link: link_rx.clone(),
            },
        );
        hub.record_event(MemEvent::Accepted { listener: addr, peer });
        if let Err(rejected) = accept_tx.try_send(server_side) {
            // the rejected sink records its own closure, which needs the lock
            drop(hub);
            drop(rejected);
            return Err(refused());
        }
        hub.links.entry(addr).or_default().push(link_tx);

        Ok(Connection::new(
            addr,
            MemSink {
                tx: to_server,
                link: link_rx.clone(),
                accepted: None,
            },
            MemStream {
                rx: from_server,
                link: link_rx,
            },
        ))
    }

    async fn bind(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError> {
        let mut hub = self.hub.lock();
        let addr = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), hub.ephemeral_addr().port())
        } else {
            addr
        };
        if hub.listeners.contains_key(&addr) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} already bound", addr),
            )));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        hub.listeners.insert(addr, tx);
        Ok(Box::new(MemListener {
            hub: Arc::clone(&self.hub),
            local_addr: addr,
            accepted: rx,
            closed: false,
        }))
    }
}

fn reset() -> TransportError {
    TransportError::Io(io::Error::new(
        io::ErrorKind::ConnectionReset,
        "in-memory link severed",
    ))
}

struct MemSink {
    tx: mpsc::Sender<Bytes>,
    link: watch::Receiver<bool>,
    /// Hub, listener and peer for the accepted side.
    accepted: Option<(Arc<Mutex<Hub>>, SocketAddr, SocketAddr)>,
}

#[async_trait]
impl FrameSink for MemSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if *self.link.borrow() {
            return Err(reset());
        }
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

impl Drop for MemSink {
    fn drop(&mut self) {
        if let Some((hub, listener, peer)) = self.accepted.take() {
            hub.lock()
                .record_event(MemEvent::ConnectionClosed { listener, peer });
        }
    }
}

struct MemStream {
    rx: mpsc::Receiver<Bytes>,
    link: watch::Receiver<bool>,
}

#[async_trait]
impl FrameStream for MemStream {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        if *self.link.borrow() {
            return Err(reset());
        }
        tokio::select! {
            frame = self.rx.recv() => Ok(frame),
            Ok(_) = self.link.wait_for(|severed| *severed) => Err(reset()),
        }
    }
}

struct MemListener {
    hub: Arc<Mutex<Hub>>,
    local_addr: SocketAddr,
    accepted: mpsc::Receiver<Connection>,
    closed: bool,
}

#[async_trait]
impl Listener for MemListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&mut self) -> Result<Connection, TransportError> {
        self.accepted.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.accepted.close();
        let mut hub = self.hub.lock();
        hub.listeners.remove(&self.local_addr);
        hub.record_event(MemEvent::ListenerClosed(self.local_addr));
    }
}

impl Drop for MemListener {
    fn drop(&mut self) {
        if !self.closed {
            self.hub.lock().listeners.remove(&self.local_addr);
        }
    }
}
