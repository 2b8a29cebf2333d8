//! # Promise Pipeline
//!
//! Per-message delivery tracker.
//!
//! ```text
//! SendScheduled ──▶ Queued ──▶ Sent
//!      │   │          │──────▶ Cancelled
//!      │   │          │──────▶ FailedTimeout
//!      │   │          └──────▶ FailedTransport
//!      │   └─────────────────▶ Cancelled
//!      └─────────────────────▶ FailedSerialization
//! ```
//!
//! Transitions are monotonic. Once terminal, a promise never changes and its
//! completion callbacks have run exactly once.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

static NEXT_PROMISE_ID: AtomicU64 = AtomicU64::new(1);

/// Delivery state of one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    /// Accepted by `send`, not yet in the queue.
    SendScheduled,
    /// In the outbound queue.
    Queued,
    /// Handed to the transport successfully.
    Sent,
    /// Context closed before transmission.
    Cancelled,
    /// Not transmitted before the endpoint's send timeout.
    FailedTimeout,
    /// Payload could not be encoded.
    FailedSerialization,
    /// Transport reported a transmission error.
    FailedTransport,
}

impl PromiseState {
    /// Whether the state is final.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::SendScheduled | Self::Queued)
    }

    /// Whether the pipeline permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: PromiseState) -> bool {
        use PromiseState::*;
        matches!(
            (self, next),
            (SendScheduled, Queued)
                | (SendScheduled, Cancelled)
                | (SendScheduled, FailedSerialization)
                | (Queued, Sent)
                | (Queued, Cancelled)
                | (Queued, FailedTimeout)
                | (Queued, FailedTransport)
        )
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SendScheduled => "SendScheduled",
            Self::Queued => "Queued",
            Self::Sent => "Sent",
            Self::Cancelled => "Cancelled",
            Self::FailedTimeout => "FailedTimeout",
            Self::FailedSerialization => "FailedSerialization",
            Self::FailedTransport => "FailedTransport",
        };
        f.write_str(name)
    }
}

type Completion = Box<dyn FnOnce(PromiseState) + Send>;

/// Handle on one message's delivery lifecycle.
///
/// Cloning shares the same underlying cell.
#[derive(Clone)]
pub struct Promise {
    inner: Arc<PromiseInner>,
}

struct PromiseInner {
    id: u64,
    context_key: Arc<str>,
    payload: Bytes,
    state: watch::Sender<PromiseState>,
    /// Set while the drain worker is writing the payload.
    in_flight: AtomicBool,
    completions: Mutex<Vec<Completion>>,
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.inner.id)
            .field("context_key", &self.inner.context_key)
            .field("payload_len", &self.inner.payload.len())
            .field("state", &self.state())
            .finish()
    }
}

impl Promise {
    /// New promise in `SendScheduled`.
    pub(crate) fn new(context_key: Arc<str>, payload: Bytes) -> Self {
        let (state, _) = watch::channel(PromiseState::SendScheduled);
        Self {
            inner: Arc::new(PromiseInner {
                id: NEXT_PROMISE_ID.fetch_add(1, Ordering::Relaxed),
                context_key,
                payload,
                state,
                in_flight: AtomicBool::new(false),
                completions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Promise that is already terminal.
    pub(crate) fn resolved(context_key: Arc<str>, state: PromiseState) -> Self {
        let promise = Self::new(context_key, Bytes::new());
        promise.transition(state);
        promise
    }

    /// Process-unique identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Identity key of the owning context.
    #[must_use]
    pub fn context_key(&self) -> &str {
        &self.inner.context_key
    }

    /// Encoded payload (empty if encoding failed).
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.inner.payload
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> PromiseState {
        *self.inner.state.borrow()
    }

    /// Whether the promise reached a final state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Wait for the terminal state.
    pub async fn wait(&self) -> PromiseState {
        let mut rx = self.inner.state.subscribe();
        // the sender lives in `self`, so the channel cannot close here
        let state = match rx.wait_for(PromiseState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Run `f` once with the terminal state; immediately if already final.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(PromiseState) + Send + 'static,
    {
        let mut completions = self.inner.completions.lock();
        let state = self.state();
        if state.is_terminal() {
            drop(completions);
            f(state);
        } else {
            completions.push(Box::new(f));
        }
    }

    /// Apply `next` if the pipeline allows it. Returns whether it applied.
    pub(crate) fn transition(&self, next: PromiseState) -> bool {
        let applied = self.inner.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });

        if applied {
            trace!(promise_id = self.inner.id, state = %next, "Promise transition");
            if next.is_terminal() {
                self.complete(next);
            }
        }
        applied
    }

    /// Reserve a queued promise for writing. Fails if it already resolved.
    pub(crate) fn claim(&self) -> bool {
        let mut claimed = false;
        self.inner.state.send_if_modified(|current| {
            if *current == PromiseState::Queued {
                self.inner.in_flight.store(true, Ordering::SeqCst);
                claimed = true;
            }
            false
        });
        claimed
    }

    /// Undo [`claim`](Self::claim) so the promise may be retried or expire.
    pub(crate) fn release(&self) {
        self.inner.state.send_if_modified(|_| {
            self.inner.in_flight.store(false, Ordering::SeqCst);
            false
        });
    }

    /// Fail with `FailedTimeout` unless the payload is being written.
    pub(crate) fn expire(&self) -> bool {
        let applied = self.inner.state.send_if_modified(|current| {
            if *current == PromiseState::Queued && !self.inner.in_flight.load(Ordering::SeqCst) {
                *current = PromiseState::FailedTimeout;
                true
            } else {
                false
            }
        });

        if applied {
            trace!(promise_id = self.inner.id, "Promise expired");
            self.complete(PromiseState::FailedTimeout);
        }
        applied
    }

    fn complete(&self, state: PromiseState) {
        let completions = std::mem::take(&mut *self.inner.completions.lock());
        for f in completions {
            f(state);
        }
    }
}
