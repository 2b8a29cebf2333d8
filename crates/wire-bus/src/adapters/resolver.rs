//! Destination resolution.
//!
//! FQDN has priority over the literal address. When the FQDN lookup fails
//! or returns nothing, the literal address is used instead if present.
//! Port and transport checks are left to the caller: dialing requires a
//! port, serving may bind port 0.

use crate::domain::EndpointConfig;
use crate::error::BusError;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

/// Resolve an endpoint's destination to a socket address.
pub async fn resolve(config: &EndpointConfig) -> Result<SocketAddr, BusError> {
    if config.fqdn.is_empty() && config.address.is_empty() {
        return Err(BusError::MissingDestinationInfo);
    }

    if !config.fqdn.is_empty() {
        match lookup(&config.fqdn, config.port).await {
            Ok(addr) => {
                debug!(fqdn = %config.fqdn, resolved = %addr, "Resolved endpoint host");
                return Ok(addr);
            }
            Err(e) if config.address.is_empty() => return Err(e),
            Err(e) => {
                warn!(
                    fqdn = %config.fqdn,
                    fallback = %config.address,
                    error = %e,
                    "FQDN lookup failed, using literal address"
                );
            }
        }
    }

    match config.address.parse::<IpAddr>() {
        Ok(ip) => Ok(SocketAddr::new(ip, config.port)),
        Err(_) => lookup(&config.address, config.port).await,
    }
}

async fn lookup(host: &str, port: u16) -> Result<SocketAddr, BusError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| BusError::Resolution {
            host: host.to_string(),
            source,
        })?;

    addrs.next().ok_or_else(|| BusError::Resolution {
        host: host.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
    })
}
