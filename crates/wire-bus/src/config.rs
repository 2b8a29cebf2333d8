//! Runtime-wide configuration.
//!
//! Per-connection settings live on [`EndpointConfig`](crate::EndpointConfig);
//! this holds the knobs shared by every connection of a [`Bus`](crate::Bus).

use crate::error::BusError;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::env;
use std::time::Duration;

/// Queue capacity used when an endpoint leaves `buffer_size` at zero.
pub const DEFAULT_BUFFER_SIZE: usize = 8;

/// Largest frame accepted on stream and message-framed transports (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest UDP payload over IPv4.
pub const DEFAULT_MAX_DATAGRAM_LEN: usize = 65_507;

/// Configuration shared by all connections of a bus.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Outbound queue capacity for endpoints with `buffer_size == 0`.
    pub default_buffer_size: usize,

    /// Maximum frame length for tcp/ws transports.
    pub max_frame_len: usize,

    /// Maximum datagram length for the udp transport.
    pub max_datagram_len: usize,

    /// Upper bound on a single dial attempt and on an inbound WebSocket upgrade.
    #[serde(rename = "connect_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_datagram_len: DEFAULT_MAX_DATAGRAM_LEN,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BusConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `WIREBUS_DEFAULT_BUFFER_SIZE`: queue capacity (default: 8)
    /// - `WIREBUS_MAX_FRAME_LEN`: frame limit in bytes (default: 16 MiB)
    /// - `WIREBUS_MAX_DATAGRAM_LEN`: datagram limit in bytes (default: 65507)
    /// - `WIREBUS_CONNECT_TIMEOUT_MS`: dial timeout (default: 10000)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            default_buffer_size: env_parse("WIREBUS_DEFAULT_BUFFER_SIZE")
                .filter(|size| *size > 0)
                .unwrap_or(defaults.default_buffer_size),

            max_frame_len: env_parse("WIREBUS_MAX_FRAME_LEN").unwrap_or(defaults.max_frame_len),

            max_datagram_len: env_parse("WIREBUS_MAX_DATAGRAM_LEN")
                .unwrap_or(defaults.max_datagram_len),

            connect_timeout: env_parse("WIREBUS_CONNECT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
        }
    }

    /// Parse configuration from a TOML document.
    ///
    /// Missing keys take their default value.
    pub fn from_toml_str(source: &str) -> Result<Self, BusError> {
        let config: Self = toml::from_str(source).map_err(|e| BusError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.default_buffer_size == 0 {
            return Err(BusError::Config("default_buffer_size must be positive".into()));
        }
        if self.max_frame_len == 0 || self.max_datagram_len == 0 {
            return Err(BusError::Config("frame limits must be positive".into()));
        }
        Ok(())
    }

    /// Queue capacity for an endpoint that requested `requested` slots.
    #[must_use]
    pub fn buffer_size_for(&self, requested: usize) -> usize {
        if requested == 0 {
            self.default_buffer_size
        } else {
            requested
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
