//! # Adapters
//!
//! Concrete implementations of the ports:
//!
//! - Transports: [`TcpTransport`], [`UdpTransport`], [`WsTransport`] and the
//!   in-process [`MemoryTransport`]
//! - Message formats: [`BincodeFormat`], [`JsonFormat`]
//! - Destination resolution

pub mod format;
pub mod memory;
pub mod resolver;
pub mod tcp;
pub mod udp;
pub mod ws;

pub use format::{BincodeFormat, JsonFormat};
pub use memory::{MemEvent, MemoryTransport};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;
pub use ws::WsTransport;

use crate::config::BusConfig;
use crate::domain::TransportKind;
use crate::ports::Transport;
use std::collections::HashMap;
use std::sync::Arc;

/// Network transports registered on every new bus.
///
/// The in-process transport is not included; register it explicitly.
pub fn default_transports(config: &BusConfig) -> HashMap<TransportKind, Arc<dyn Transport>> {
    let mut transports: HashMap<TransportKind, Arc<dyn Transport>> = HashMap::new();
    transports.insert(
        TransportKind::Tcp,
        Arc::new(TcpTransport::new(config.max_frame_len)),
    );
    transports.insert(
        TransportKind::Udp,
        Arc::new(UdpTransport::new(config.max_datagram_len)),
    );
    transports.insert(
        TransportKind::Ws,
        Arc::new(WsTransport::new(config.max_frame_len).with_handshake_timeout(config.connect_timeout)),
    );
    transports
}
