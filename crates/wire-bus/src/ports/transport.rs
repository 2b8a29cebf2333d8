//! # Transport Port
//!
//! Byte-level boundary between the connection runtime and a concrete wire.
//! One implementation exists per [`TransportKind`]; a context picks its
//! adapter once at construction and keeps it for its whole lifetime.
//!
//! Adapters deal in whole frames: framing (length prefix, datagram, ws
//! message) is the adapter's concern, schema encoding is not.

use crate::domain::TransportKind;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

/// Per-dial parameters taken from the endpoint.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Host name the address was resolved from, if any.
    pub host: Option<String>,
    /// WebSocket `Origin` header.
    pub origin: Option<String>,
    /// WebSocket request path.
    pub resource_path: Option<String>,
}

/// Factory for connections and listeners of one transport kind.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind served by this adapter.
    fn kind(&self) -> TransportKind;

    /// Establish an outbound connection.
    async fn dial(&self, addr: SocketAddr, options: &DialOptions) -> Result<Connection, TransportError>;

    /// Start listening on `addr`.
    async fn bind(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError>;
}

/// Writing half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Transmit one frame.
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Release the write side. Best effort.
    async fn close(&mut self) {}
}

/// Reading half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame; `Ok(None)` once the peer closed cleanly.
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Accepting side of a transport.
#[async_trait]
pub trait Listener: Send {
    /// Address the listener is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> Result<Connection, TransportError>;

    /// Stop accepting. Best effort.
    async fn close(&mut self) {}
}

/// An established connection split into its two halves.
pub struct Connection {
    /// Remote address.
    pub peer: SocketAddr,
    /// Write half, owned by the drain worker.
    pub sink: Box<dyn FrameSink>,
    /// Read half, owned by the read worker.
    pub stream: Box<dyn FrameStream>,
}

impl Connection {
    /// Assemble a connection from its halves.
    pub fn new(
        peer: SocketAddr,
        sink: impl FrameSink + 'static,
        stream: impl FrameStream + 'static,
    ) -> Self {
        Self {
            peer,
            sink: Box::new(sink),
            stream: Box::new(stream),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}
