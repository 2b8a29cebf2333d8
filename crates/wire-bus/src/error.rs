//! # Bus Errors
//!
//! Error taxonomy for the messaging runtime.
//!
//! - **Configuration / resolution errors** are returned synchronously from
//!   `Bus::dial` or reported through the `serve` callback.
//! - **Transport errors** are absorbed by the Context workers and turned
//!   into state transitions; they only surface from `dial` when no
//!   reconnect policy is active.
//! - **Per-message errors** never appear here: they are terminal
//!   [`PromiseState`](crate::PromiseState)s.

use thiserror::Error;

/// Errors returned by the bus entry points.
#[derive(Debug, Error)]
pub enum BusError {
    /// Transport kind is unknown or has no adapter registered.
    #[error("Invalid transport: {0}")]
    InvalidTransport(String),

    /// Neither address nor FQDN, no port, or no transport configured.
    #[error("Missing fqdn/ip, port or transport")]
    MissingDestinationInfo,

    /// A live connection (or listener) already owns this identity key.
    #[error("Endpoint already registered: {0}")]
    EndpointAlreadyRegistered(String),

    /// No message format was supplied to decode incoming bytes.
    #[error("Prototype instance is missing")]
    MissingPrototype,

    /// No message handler was supplied.
    #[error("Missing message handler implementation")]
    MissingMessageHandler,

    /// Address or FQDN lookup failed.
    #[error("Failed to resolve {host}: {source}")]
    Resolution {
        /// Host that was looked up.
        host: String,
        /// Underlying resolver error.
        #[source]
        source: std::io::Error,
    },

    /// Transport establishment failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Stop requested for an endpoint that is not being served.
    #[error("Endpoint already stopped or never served with id: {0}")]
    NotServing(String),

    /// A listener did not shut down cleanly.
    #[error("Listener {id} failed to shut down: {reason}")]
    ListenerShutdown {
        /// Endpoint identifier of the listener.
        id: String,
        /// Why the shutdown failed.
        reason: String,
    },

    /// Invalid runtime configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Errors reported by transport adapters.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Remote peer refused the connection.
    #[error("connection to {remote} refused")]
    ConnectionRefused {
        /// Remote address.
        remote: String,
    },

    /// Establishment did not complete in time.
    #[error("connection to {remote} timed out")]
    Timeout {
        /// Remote address.
        remote: String,
    },

    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Frame exceeds the configured limit.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Size of the offending frame.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// Connection or listener is closed.
    #[error("connection closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Io(io) => Self::Io(io),
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            other => Self::WebSocket(other.to_string()),
        }
    }
}

/// Errors produced by a [`MessageFormat`](crate::MessageFormat).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormatError {
    /// Message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes could not be decoded into a message.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Result alias for bus entry points.
pub type BusResult<T> = Result<T, BusError>;
