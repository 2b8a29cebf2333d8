//! Connection context lifecycle states.

use std::fmt;

/// Lifecycle of a connection context.
///
/// ```text
/// Opening ──▶ Open ──▶ Closing ──▶ Closed
///    │         │  ▲        ▲
///    │         ▼  │        │
///    │     Reconnecting ───┘
///    │         │
///    └────▶ Failed ◀┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Transport is being established.
    Opening,
    /// Transport is up; queued messages drain.
    Open,
    /// Transport was lost; the reconnect supervisor is dialing.
    Reconnecting,
    /// Close requested; workers are shutting down.
    Closing,
    /// Terminal: closed by the application or by transport loss.
    Closed,
    /// Terminal: dialing exhausted its retry budget.
    Failed,
}

impl ContextState {
    /// Whether no further transition can happen.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether `close()` still has an effect.
    #[must_use]
    pub fn is_closable(&self) -> bool {
        matches!(self, Self::Opening | Self::Open | Self::Reconnecting)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: ContextState) -> bool {
        use ContextState::*;
        matches!(
            (self, next),
            (Opening, Open)
                | (Opening, Failed)
                | (Opening, Closing)
                | (Open, Reconnecting)
                | (Open, Closing)
                | (Reconnecting, Open)
                | (Reconnecting, Failed)
                | (Reconnecting, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "Opening",
            Self::Open => "Open",
            Self::Reconnecting => "Reconnecting",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}
