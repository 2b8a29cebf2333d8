//! # Ports
//!
//! Interfaces the runtime requires from its collaborators:
//!
//! - [`Transport`] - byte-level dial/accept/read/write, one per transport kind
//! - [`MessageFormat`] - schema encoding of application messages
//! - [`MessageHandler`] / [`ContextHandler`] - application callbacks

pub mod format;
pub mod handlers;
pub mod transport;

pub use format::MessageFormat;
pub use handlers::{handler_fn, ContextHandler, FnHandler, MessageHandler};
pub use transport::{Connection, DialOptions, FrameSink, FrameStream, Listener, Transport};
