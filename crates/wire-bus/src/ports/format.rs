//! Message format port.

use crate::error::FormatError;
use bytes::Bytes;

/// Structured-message encoding supplied by the application.
///
/// Plays the role of the zero-value prototype: the context uses it to turn
/// incoming frames into `M` and outgoing `M` into frames.
pub trait MessageFormat<M>: Send + Sync {
    /// Encode a message into one frame.
    fn encode(&self, message: &M) -> Result<Bytes, FormatError>;

    /// Decode one frame into a message.
    fn decode(&self, frame: &[u8]) -> Result<M, FormatError>;

    /// Short name for logs.
    fn name(&self) -> &'static str {
        "custom"
    }
}
