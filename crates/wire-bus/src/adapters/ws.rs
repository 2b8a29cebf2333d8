//! WebSocket transport.
//!
//! One frame per binary message. Dials carry the endpoint's `Origin`
//! header and request path; text messages are accepted and passed on as
//! their UTF-8 bytes.
//!
//! The listener upgrades each inbound TCP stream in its own task, bounded
//! by the handshake timeout, so a peer that never completes the upgrade
//! does not hold up the others.

use crate::domain::TransportKind;
use crate::error::TransportError;
use crate::ports::{Connection, DialOptions, FrameSink, FrameStream, Listener, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Upgraded connections awaiting `accept`.
const ACCEPT_BACKLOG: usize = 64;

/// Default bound on a server-side upgrade.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed TCP accept.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// WebSocket transport over plain TCP.
#[derive(Debug, Clone)]
pub struct WsTransport {
    max_frame_len: usize,
    handshake_timeout: Duration,
}

impl WsTransport {
    /// Create a transport rejecting messages over `max_frame_len` bytes.
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Drop inbound peers that have not completed the upgrade within `timeout`.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn split(&self, ws: WebSocketStream<TcpStream>, peer: SocketAddr) -> Connection {
        let (sink, stream) = ws.split();
        Connection::new(
            peer,
            WsSink {
                sink,
                max_frame_len: self.max_frame_len,
            },
            WsStream {
                stream,
                max_frame_len: self.max_frame_len,
            },
        )
    }
}

/// Build `ws://host:port/path` for a dial.
fn request_url(addr: SocketAddr, options: &DialOptions) -> String {
    let authority = match &options.host {
        Some(host) => format!("{}:{}", host, addr.port()),
        None => addr.to_string(),
    };
    let path = options.resource_path.as_deref().unwrap_or("/");
    if path.starts_with('/') {
        format!("ws://{}{}", authority, path)
    } else {
        format!("ws://{}/{}", authority, path)
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ws
    }

    async fn dial(&self, addr: SocketAddr, options: &DialOptions) -> Result<Connection, TransportError> {
        let url = request_url(addr, options);
        let mut request = url.as_str().into_client_request()?;
        if let Some(origin) = &options.origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| TransportError::WebSocket(format!("invalid origin: {}", e)))?;
            request.headers_mut().insert(header::ORIGIN, value);
        }

        let stream = TcpStream::connect(addr).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                remote: addr.to_string(),
            },
            _ => TransportError::Io(e),
        })?;
        let _ = stream.set_nodelay(true);

        let (ws, response) = tokio_tungstenite::client_async(request, stream).await?;
        debug!(url = %url, status = %response.status(), "WebSocket handshake complete");
        Ok(self.split(ws, addr))
    }

    async fn bind(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let upgrades = tokio::spawn(accept_upgrades(listener, self.clone(), accept_tx));

        Ok(Box::new(WsListener {
            local_addr,
            accepted: accept_rx,
            upgrades: Some(upgrades),
        }))
    }
}

type Accepted = Result<Connection, TransportError>;

/// Accept TCP streams and upgrade each one concurrently.
///
/// Dropping the task aborts every upgrade still in flight.
async fn accept_upgrades(listener: TcpListener, transport: WsTransport, accept_tx: mpsc::Sender<Accepted>) {
    let mut handshakes = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    handshakes.spawn(upgrade(stream, peer, transport.clone(), accept_tx.clone()));
                }
                Err(e) => {
                    if accept_tx.send(Err(e.into())).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(ACCEPT_RETRY).await;
                }
            },
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
            _ = accept_tx.closed() => return,
        }
    }
}

async fn upgrade(stream: TcpStream, peer: SocketAddr, transport: WsTransport, accept_tx: mpsc::Sender<Accepted>) {
    match tokio::time::timeout(transport.handshake_timeout, tokio_tungstenite::accept_async(stream)).await {
        Ok(Ok(ws)) => {
            debug!(peer = %peer, "WebSocket connection accepted");
            let _ = accept_tx.send(Ok(transport.split(ws, peer))).await;
        }
        Ok(Err(e)) => warn!(peer = %peer, error = %e, "WebSocket handshake failed"),
        Err(_) => warn!(
            peer = %peer,
            timeout_ms = transport.handshake_timeout.as_millis() as u64,
            "WebSocket handshake timed out"
        ),
    }
}

struct WsSink {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    max_frame_len: usize,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }
        self.sink.send(Message::Binary(frame)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct WsStream {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    max_frame_len: usize,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        while let Some(message) = self.stream.next().await {
            let frame = match message {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
                Ok(Message::Close(_)) => return Ok(None),
                // control frames are answered by tungstenite itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            if frame.len() > self.max_frame_len {
                return Err(TransportError::FrameTooLarge {
                    len: frame.len(),
                    max: self.max_frame_len,
                });
            }
            return Ok(Some(frame));
        }
        Ok(None)
    }
}

struct WsListener {
    local_addr: SocketAddr,
    accepted: mpsc::Receiver<Accepted>,
    upgrades: Option<JoinHandle<()>>,
}

#[async_trait]
impl Listener for WsListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&mut self) -> Result<Connection, TransportError> {
        self.accepted.recv().await.unwrap_or(Err(TransportError::Closed))
    }

    async fn close(&mut self) {
        if let Some(upgrades) = self.upgrades.take() {
            upgrades.abort();
            let _ = upgrades.await;
            self.accepted.close();
            debug!(local = %self.local_addr, "WebSocket listener closed");
        }
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        if let Some(upgrades) = self.upgrades.take() {
            upgrades.abort();
        }
    }
}
