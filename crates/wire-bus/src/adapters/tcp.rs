//! TCP transport.
//!
//! Wire format: each frame is a 4-byte big-endian length followed by the
//! payload. Frames longer than `max_frame_len` are rejected on both sides.

use crate::domain::TransportKind;
use crate::error::TransportError;
use crate::ports::{Connection, DialOptions, FrameSink, FrameStream, Listener, Transport};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

const LENGTH_PREFIX: usize = 4;

/// Length-prefixed TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    max_frame_len: usize,
}

impl TcpTransport {
    /// Create a transport rejecting frames over `max_frame_len` bytes.
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(u32::MAX as usize),
        }
    }

    fn split(&self, stream: TcpStream, peer: SocketAddr) -> Connection {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Connection::new(
            peer,
            TcpSink {
                write,
                max_frame_len: self.max_frame_len,
            },
            TcpStreamReader {
                read,
                max_frame_len: self.max_frame_len,
            },
        )
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn dial(&self, addr: SocketAddr, _options: &DialOptions) -> Result<Connection, TransportError> {
        let stream = TcpStream::connect(addr).await.map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                remote: addr.to_string(),
            },
            _ => TransportError::Io(e),
        })?;
        debug!(remote = %addr, "TCP connection established");
        Ok(self.split(stream, addr))
    }

    async fn bind(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Box::new(TcpFrameListener {
            transport: self.clone(),
            listener: Some(listener),
            local_addr,
        }))
    }
}

struct TcpSink {
    write: OwnedWriteHalf,
    max_frame_len: usize,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + frame.len());
        buf.put_u32(frame.len() as u32);
        buf.put_slice(&frame);
        self.write.write_all(&buf).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.write.shutdown().await;
    }
}

struct TcpStreamReader {
    read: OwnedReadHalf,
    max_frame_len: usize,
}

#[async_trait]
impl FrameStream for TcpStreamReader {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        let len = match self.read.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if len > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let mut payload = vec![0u8; len];
        self.read.read_exact(&mut payload).await?;
        Ok(Some(Bytes::from(payload)))
    }
}

struct TcpFrameListener {
    transport: TcpTransport,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
}

#[async_trait]
impl Listener for TcpFrameListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&mut self) -> Result<Connection, TransportError> {
        let listener = self.listener.as_ref().ok_or(TransportError::Closed)?;
        let (stream, peer) = listener.accept().await?;
        debug!(local = %self.local_addr, peer = %peer, "TCP connection accepted");
        Ok(self.transport.split(stream, peer))
    }

    async fn close(&mut self) {
        if self.listener.take().is_some() {
            debug!(local = %self.local_addr, "TCP listener closed");
        }
    }
}
