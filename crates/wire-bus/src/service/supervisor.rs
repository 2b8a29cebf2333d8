//! # Reconnect Supervisor
//!
//! Drives transport establishment for initiator contexts.
//!
//! - Fixed `delay` between attempts, never exponential
//! - `max_attempt_count <= 0` retries forever; otherwise the supervisor gives
//!   up after that many consecutive failures
//! - A successful attempt resets the failure counter
//! - A shutdown signal cancels both the wait and an attempt in progress

use crate::domain::ReconnectPolicy;
use crate::error::TransportError;
use crate::ports::{Connection, DialOptions, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Outcome of a reconnect episode.
pub(crate) enum Reconnect {
    /// A new connection is up.
    Connected(Connection),
    /// Consecutive failures reached the attempt budget.
    Exhausted,
    /// Shutdown was requested.
    Cancelled,
}

/// Dial parameters and retry state of one initiator context.
pub(crate) struct Supervisor {
    transport: Arc<dyn Transport>,
    addr: SocketAddr,
    options: DialOptions,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    failures: u32,
}

impl Supervisor {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        addr: SocketAddr,
        options: DialOptions,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            addr,
            options,
            policy,
            connect_timeout,
            failures: 0,
        }
    }

    /// Whether lost connections are re-dialed.
    pub(crate) fn enabled(&self) -> bool {
        self.policy.should_reconnect
    }

    /// Consecutive failed attempts so far.
    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    /// One establishment attempt bounded by the connect timeout.
    pub(crate) async fn connect_once(&self) -> Result<Connection, TransportError> {
        match tokio::time::timeout(
            self.connect_timeout,
            self.transport.dial(self.addr, &self.options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                remote: self.addr.to_string(),
            }),
        }
    }

    /// Count a failed attempt made outside [`reconnect`](Self::reconnect).
    pub(crate) fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// Wait and re-dial until connected, exhausted or cancelled.
    pub(crate) async fn reconnect(&mut self, key: &str, shutdown: &mut watch::Receiver<bool>) -> Reconnect {
        loop {
            if self.policy.is_exhausted(self.failures) {
                warn!(
                    key,
                    attempts = self.failures,
                    "Reconnect attempts exhausted"
                );
                return Reconnect::Exhausted;
            }

            tokio::select! {
                biased;
                _ = shutdown_signalled(shutdown) => return Reconnect::Cancelled,
                _ = tokio::time::sleep(self.policy.delay) => {}
            }

            let attempt = self.failures + 1;
            let result = tokio::select! {
                biased;
                _ = shutdown_signalled(shutdown) => return Reconnect::Cancelled,
                result = self.connect_once() => result,
            };

            match result {
                Ok(connection) => {
                    info!(key, attempt, peer = %connection.peer, "Reconnected");
                    self.failures = 0;
                    return Reconnect::Connected(connection);
                }
                Err(e) => {
                    self.record_failure();
                    warn!(key, attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }
    }
}

/// Resolve once `signal` is raised or its sender is gone.
pub(crate) async fn shutdown_signalled(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|raised| *raised).await;
}
