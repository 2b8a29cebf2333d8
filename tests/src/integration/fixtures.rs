//! Shared fixtures for the integration scenarios.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wire_bus::{
    BusError, Connection, Context, ContextHandler, ContextState, DialOptions, Endpoint,
    EndpointConfig, FormatError, FrameSink, JsonFormat, Listener, MemoryTransport, MessageFormat,
    MessageHandler, ResultFn, Transport, TransportError, TransportKind,
};

/// Application message used throughout the suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub seq: u32,
    pub body: String,
}

impl Ping {
    pub fn new(seq: u32) -> Self {
        Self {
            seq,
            body: format!("ping-{seq}"),
        }
    }
}

/// Forwards every inbound message, tagged with the receiving context key.
pub struct Collect {
    tx: mpsc::UnboundedSender<(String, Ping)>,
}

#[async_trait]
impl MessageHandler<Ping> for Collect {
    async fn on_message(&self, context: &Context<Ping>, message: Ping) {
        let _ = self.tx.send((context.key().to_string(), message));
    }
}

/// Sends every inbound message back on the same context.
pub struct Echo;

#[async_trait]
impl MessageHandler<Ping> for Echo {
    async fn on_message(&self, context: &Context<Ping>, message: Ping) {
        context.send(&message).await;
    }
}

/// Records lifecycle callbacks as `"opened:{key}"` / `"closing:{key}"`.
#[derive(Default)]
pub struct Journal {
    pub entries: Mutex<Vec<String>>,
}

#[async_trait]
impl ContextHandler<Ping> for Journal {
    async fn opened(&self, context: &Context<Ping>) {
        self.entries.lock().push(format!("opened:{}", context.key()));
    }

    async fn closing(&self, context: &Context<Ping>) {
        self.entries.lock().push(format!("closing:{}", context.key()));
    }
}

impl Journal {
    pub fn count(&self, prefix: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }
}

/// In-memory transport whose dials and binds can be made to hang.
pub struct Gate {
    inner: MemoryTransport,
    stalled: AtomicBool,
}

impl Gate {
    pub fn new(inner: MemoryTransport) -> Self {
        Self {
            inner,
            stalled: AtomicBool::new(false),
        }
    }

    /// Make every later dial and bind pend forever.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.stalled.store(false, Ordering::SeqCst);
    }

    async fn wait_open(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Transport for Gate {
    fn kind(&self) -> TransportKind {
        TransportKind::Mem
    }

    async fn dial(&self, addr: SocketAddr, options: &DialOptions) -> Result<Connection, TransportError> {
        self.wait_open().await;
        self.inner.dial(addr, options).await
    }

    async fn bind(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError> {
        self.wait_open().await;
        self.inner.bind(addr).await
    }
}

/// In-memory transport whose very first write fails with a broken pipe.
///
/// Later writes, on any connection, go through.
pub struct Tripwire {
    inner: MemoryTransport,
    tripped: Arc<AtomicBool>,
}

impl Tripwire {
    pub fn new(inner: MemoryTransport) -> Self {
        Self {
            inner,
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for Tripwire {
    fn kind(&self) -> TransportKind {
        TransportKind::Mem
    }

    async fn dial(&self, addr: SocketAddr, options: &DialOptions) -> Result<Connection, TransportError> {
        let connection = self.inner.dial(addr, options).await?;
        Ok(Connection {
            peer: connection.peer,
            sink: Box::new(TrippedSink {
                inner: connection.sink,
                tripped: Arc::clone(&self.tripped),
            }),
            stream: connection.stream,
        })
    }

    async fn bind(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError> {
        self.inner.bind(addr).await
    }
}

struct TrippedSink {
    inner: Box<dyn FrameSink>,
    tripped: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for TrippedSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "first write refused",
            )));
        }
        self.inner.send_frame(frame).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

/// JSON format that refuses to encode pings with an empty body.
pub struct NonEmptyBody;

impl MessageFormat<Ping> for NonEmptyBody {
    fn encode(&self, message: &Ping) -> Result<Bytes, FormatError> {
        if message.body.is_empty() {
            return Err(FormatError::Encode(format!("ping {} has no body", message.seq)));
        }
        JsonFormat::<Ping>::new().encode(message)
    }

    fn decode(&self, frame: &[u8]) -> Result<Ping, FormatError> {
        JsonFormat::<Ping>::new().decode(frame)
    }
}

/// Endpoint config on the loopback address.
pub fn config(id: &str, transport: TransportKind, port: u16) -> EndpointConfig {
    EndpointConfig::new(id, transport).with_address("127.0.0.1", port)
}

/// Endpoint whose inbound messages are forwarded to the returned receiver.
pub fn collecting(config: EndpointConfig) -> (Endpoint<Ping>, mpsc::UnboundedReceiver<(String, Ping)>) {
    collecting_with(config, JsonFormat::<Ping>::new())
}

/// [`collecting`] with an explicit message format.
pub fn collecting_with(
    config: EndpointConfig,
    format: impl MessageFormat<Ping> + 'static,
) -> (Endpoint<Ping>, mpsc::UnboundedReceiver<(String, Ping)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let endpoint = Endpoint::new(config)
        .with_format(format)
        .with_handler(Collect { tx });
    (endpoint, rx)
}

/// Endpoint that echoes every inbound message.
pub fn echoing(config: EndpointConfig) -> Endpoint<Ping> {
    Endpoint::new(config)
        .with_format(JsonFormat::<Ping>::new())
        .with_handler(Echo)
}

/// Endpoint that drops inbound messages.
pub fn silent(config: EndpointConfig) -> Endpoint<Ping> {
    let (endpoint, _rx) = collecting(config);
    endpoint
}

/// Error callback forwarding `(endpoint id, error)` to the returned receiver.
pub fn error_channel() -> (ResultFn, mpsc::UnboundedReceiver<(String, BusError)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ResultFn = Arc::new(move |config: &EndpointConfig, error: BusError| {
        let _ = tx.send((config.id.clone(), error));
    });
    (callback, rx)
}

/// Wait until `context` reports `state`.
pub async fn wait_for_state(context: &Context<Ping>, state: ContextState) -> anyhow::Result<()> {
    let mut rx = context.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|current| *current == state))
        .await??;
    Ok(())
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Next collected message, failing after five seconds.
pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<(String, Ping)>) -> anyhow::Result<(String, Ping)> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("handler channel closed"))
}

/// Loopback address with `port`.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
