//! Serde-backed message formats.

use crate::error::FormatError;
use crate::ports::MessageFormat;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Compact binary encoding via `bincode`.
#[derive(Debug)]
pub struct BincodeFormat<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> BincodeFormat<M> {
    /// Create the format.
    #[must_use]
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M> Default for BincodeFormat<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MessageFormat<M> for BincodeFormat<M>
where
    M: Serialize + DeserializeOwned,
{
    fn encode(&self, message: &M) -> Result<Bytes, FormatError> {
        bincode::serialize(message)
            .map(Bytes::from)
            .map_err(|e| FormatError::Encode(e.to_string()))
    }

    fn decode(&self, frame: &[u8]) -> Result<M, FormatError> {
        bincode::deserialize(frame).map_err(|e| FormatError::Decode(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "bincode"
    }
}

/// JSON encoding via `serde_json`.
#[derive(Debug)]
pub struct JsonFormat<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> JsonFormat<M> {
    /// Create the format.
    #[must_use]
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M> Default for JsonFormat<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MessageFormat<M> for JsonFormat<M>
where
    M: Serialize + DeserializeOwned,
{
    fn encode(&self, message: &M) -> Result<Bytes, FormatError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| FormatError::Encode(e.to_string()))
    }

    fn decode(&self, frame: &[u8]) -> Result<M, FormatError> {
        serde_json::from_slice(frame).map_err(|e| FormatError::Decode(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
