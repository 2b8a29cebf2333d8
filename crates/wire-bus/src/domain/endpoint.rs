//! # Endpoint
//!
//! Caller-supplied description of one connection target or listening
//! service. The data half ([`EndpointConfig`]) is plain configuration and can
//! be loaded from TOML; [`Endpoint`] attaches the pluggable behaviors.
//!
//! ## Identity
//!
//! Live connections are keyed by `"{id}-{address}:{port}-{transport}"`.
//! On the accepting side `id` is the only handle for stop and lookup
//! operations, so it must be stable and non-empty there.

use crate::error::BusError;
use crate::ports::{ContextHandler, MessageFormat, MessageHandler};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// TRANSPORT KIND
// =============================================================================

/// Wire transport an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransportKind {
    /// Stream socket with length-prefixed frames.
    Tcp,
    /// Datagram socket, one frame per datagram.
    Udp,
    /// WebSocket, one frame per binary message.
    Ws,
    /// In-process transport.
    Mem,
}

impl TransportKind {
    /// Lowercase name used in identity keys and configuration.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Ws => "ws",
            Self::Mem => "mem",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "ws" => Ok(Self::Ws),
            "mem" => Ok(Self::Mem),
            _ => Err(BusError::InvalidTransport(s.to_string())),
        }
    }
}

impl TryFrom<String> for TransportKind {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransportKind> for String {
    fn from(kind: TransportKind) -> Self {
        kind.as_str().to_string()
    }
}

// =============================================================================
// RECONNECT POLICY
// =============================================================================

/// Re-dial policy for initiator-side connections.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Whether a lost or failed connection is re-dialed.
    pub should_reconnect: bool,

    /// Consecutive failed attempts before giving up; zero or negative
    /// retries forever.
    pub max_attempt_count: i32,

    /// Fixed wait between attempts.
    #[serde(rename = "delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub delay: Duration,
}

impl ReconnectPolicy {
    /// Reconnection disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Reconnect with at most `max_attempt_count` consecutive failures.
    #[must_use]
    pub fn new(max_attempt_count: i32, delay: Duration) -> Self {
        Self {
            should_reconnect: true,
            max_attempt_count,
            delay,
        }
    }

    /// Whether `failures` consecutive failed attempts use up the budget.
    #[must_use]
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempt_count > 0 && failures >= self.max_attempt_count as u32
    }
}

// =============================================================================
// THROTTLING
// =============================================================================

/// What one throttle token stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThrottleStrategy {
    /// One token per message.
    #[default]
    #[serde(rename = "message-per-second", alias = "mps")]
    MessagesPerSecond,
    /// One token per byte. Best effort: a large message waits for enough
    /// cumulative refill rather than being split.
    #[serde(rename = "bytes-per-second", alias = "bps")]
    BytesPerSecond,
}

impl ThrottleStrategy {
    /// Tokens consumed by a frame of `len` bytes.
    #[must_use]
    pub fn cost(&self, len: usize) -> u64 {
        match self {
            Self::MessagesPerSecond => 1,
            Self::BytesPerSecond => len as u64,
        }
    }
}

/// Rate limits for one endpoint. A limit of zero leaves that direction
/// unthrottled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingCriteria {
    /// Unit of the limits below.
    pub strategy: ThrottleStrategy,

    /// Incoming messages (or bytes) processed per second.
    pub incoming_limit_per_second: u32,

    /// Outgoing messages (or bytes) written per second.
    pub outgoing_limit_per_second: u32,
}

// =============================================================================
// ENDPOINT CONFIG
// =============================================================================

/// Configuration half of an [`Endpoint`].
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Correlates contexts with their endpoint. Mandatory when serving.
    pub id: String,

    /// IPv4 or IPv6 address.
    pub address: String,

    /// Host name; takes priority over `address` when it resolves.
    pub fqdn: String,

    /// Port number.
    pub port: u16,

    /// Wire transport.
    pub transport: Option<TransportKind>,

    /// Outbound queue capacity; zero uses the bus default.
    pub buffer_size: usize,

    /// `Origin` header for WebSocket dials.
    pub origin: Option<String>,

    /// Request path for WebSocket dials.
    pub resource_path: Option<String>,

    /// Re-dial policy (initiator side only).
    pub reconnect: ReconnectPolicy,

    /// Optional inbound/outbound rate limits.
    pub throttling: Option<ThrottlingCriteria>,

    /// Deadline for a queued message to reach the transport.
    #[serde(rename = "send_timeout_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub send_timeout: Option<Duration>,
}

impl EndpointConfig {
    /// Create an endpoint configuration for `transport`.
    pub fn new(id: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: id.into(),
            transport: Some(transport),
            ..Self::default()
        }
    }

    /// Set the network address and port.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = address.into();
        self.port = port;
        self
    }

    /// Set the host name to resolve.
    #[must_use]
    pub fn with_fqdn(mut self, fqdn: impl Into<String>) -> Self {
        self.fqdn = fqdn.into();
        self
    }

    /// Set the outbound queue capacity.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set rate limits.
    #[must_use]
    pub fn with_throttling(mut self, criteria: ThrottlingCriteria) -> Self {
        self.throttling = Some(criteria);
        self
    }

    /// Set the per-message delivery deadline.
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Set WebSocket origin and request path.
    #[must_use]
    pub fn with_websocket(mut self, origin: Option<String>, resource_path: impl Into<String>) -> Self {
        self.origin = origin;
        self.resource_path = Some(resource_path.into());
        self
    }

    /// Parse a single endpoint from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, BusError> {
        toml::from_str(source).map_err(|e| BusError::Config(e.to_string()))
    }

    /// Check that the destination is fully described.
    pub fn validate_destination(&self) -> Result<TransportKind, BusError> {
        let transport = self.transport.ok_or(BusError::MissingDestinationInfo)?;
        if (self.fqdn.is_empty() && self.address.is_empty()) || self.port == 0 {
            return Err(BusError::MissingDestinationInfo);
        }
        Ok(transport)
    }
}

/// Compose the registry key of a connection.
#[must_use]
pub fn identity_key(id: &str, resolved: SocketAddr, transport: TransportKind) -> String {
    format!("{}-{}-{}", id, resolved, transport)
}

// =============================================================================
// ENDPOINT
// =============================================================================

/// Endpoint configuration plus its pluggable behaviors.
pub struct Endpoint<M: Send + 'static> {
    /// Connection target and policies.
    pub config: EndpointConfig,

    /// Encodes outgoing and decodes incoming messages. Mandatory.
    pub format: Option<Arc<dyn MessageFormat<M>>>,

    /// Receives decoded inbound messages. Mandatory.
    pub message_handler: Option<Arc<dyn MessageHandler<M>>>,

    /// Observes context open/close. Optional.
    pub context_handler: Option<Arc<dyn ContextHandler<M>>>,
}

impl<M: Send + 'static> Clone for Endpoint<M> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            format: self.format.clone(),
            message_handler: self.message_handler.clone(),
            context_handler: self.context_handler.clone(),
        }
    }
}

impl<M: Send + 'static> fmt::Debug for Endpoint<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("config", &self.config)
            .field("format", &self.format.is_some())
            .field("message_handler", &self.message_handler.is_some())
            .field("context_handler", &self.context_handler.is_some())
            .finish()
    }
}

impl<M: Send + 'static> Endpoint<M> {
    /// Wrap a configuration with no behaviors attached.
    #[must_use]
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            format: None,
            message_handler: None,
            context_handler: None,
        }
    }

    /// Attach the message format.
    #[must_use]
    pub fn with_format(mut self, format: impl MessageFormat<M> + 'static) -> Self {
        self.format = Some(Arc::new(format));
        self
    }

    /// Attach the message handler.
    #[must_use]
    pub fn with_handler(mut self, handler: impl MessageHandler<M> + 'static) -> Self {
        self.message_handler = Some(Arc::new(handler));
        self
    }

    /// Attach a shared message handler.
    #[must_use]
    pub fn with_shared_handler(mut self, handler: Arc<dyn MessageHandler<M>>) -> Self {
        self.message_handler = Some(handler);
        self
    }

    /// Attach the context lifecycle handler.
    #[must_use]
    pub fn with_context_handler(mut self, handler: impl ContextHandler<M> + 'static) -> Self {
        self.context_handler = Some(Arc::new(handler));
        self
    }

    /// Attach a shared context lifecycle handler.
    #[must_use]
    pub fn with_shared_context_handler(mut self, handler: Arc<dyn ContextHandler<M>>) -> Self {
        self.context_handler = Some(handler);
        self
    }

    /// Endpoint identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Check the mandatory behaviors and return them.
    pub(crate) fn behaviors(
        &self,
    ) -> Result<(Arc<dyn MessageFormat<M>>, Arc<dyn MessageHandler<M>>), BusError> {
        let format = self.format.clone().ok_or(BusError::MissingPrototype)?;
        let handler = self
            .message_handler
            .clone()
            .ok_or(BusError::MissingMessageHandler)?;
        Ok((format, handler))
    }
}
