//! # Connection Context
//!
//! Runtime handle for one logical connection and the session task behind it.
//!
//! ## Lifecycle
//!
//! ```text
//! Opening ──▶ Open ──▶ Reconnecting ──▶ Open
//!    │          │           │
//!    │          ▼           ▼
//!    ├─────▶ Closing ──▶ Closed
//!    └──────────────────────────────▶ Failed (also from Reconnecting)
//! ```
//!
//! ## Workers
//!
//! Each established connection runs two workers:
//!
//! - the drain worker (the session task itself) takes messages from the
//!   outbound queue in FIFO order and writes them to the transport
//! - the read worker decodes inbound frames, applies the inbound throttle
//!   and dispatches them to the message handler
//!
//! The outbound queue survives reconnects, so messages accepted while the
//! context is `Reconnecting` are written in order once it is `Open` again.
//!
//! ## Shutdown
//!
//! [`Context::close`] raises two signals: the application signal stops the
//! send path and the drain worker, the network signal stops the read worker
//! and any transport operation in progress. Queued promises that never
//! reached the wire resolve `Cancelled`; a message whose write failed
//! resolves `FailedTransport`.

use crate::domain::{ContextState, Endpoint, EndpointConfig, Promise, PromiseState, Throttles};
use crate::ports::{Connection, FrameStream, MessageFormat, MessageHandler};
use crate::service::registry::{ManagedContext, Registry, Role};
use crate::service::supervisor::{shutdown_signalled, Reconnect, Supervisor};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Upper bound on a graceful transport close.
const SINK_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// One accepted message waiting in the outbound queue.
///
/// Dropping an unresolved entry cancels its promise, which covers entries
/// still buffered when the queue is torn down.
pub(crate) struct Outbound {
    promise: Promise,
    /// A write of this message failed at least once.
    attempted: bool,
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.promise.transition(PromiseState::Cancelled);
    }
}

/// Handle on one logical connection.
///
/// Cloning is cheap and every clone refers to the same connection.
pub struct Context<M: Send + 'static> {
    inner: Arc<ContextInner<M>>,
}

struct ContextInner<M: Send + 'static> {
    endpoint: Endpoint<M>,
    format: Arc<dyn MessageFormat<M>>,
    handler: Arc<dyn MessageHandler<M>>,
    key: Arc<str>,
    destination: SocketAddr,
    role: Role,
    session_id: Uuid,
    queue: mpsc::Sender<Outbound>,
    throttles: Throttles,
    state: watch::Sender<ContextState>,
    app_quit: watch::Sender<bool>,
    net_quit: watch::Sender<bool>,
    opened_fired: AtomicBool,
    closing_fired: AtomicBool,
}

impl<M: Send + 'static> Clone for Context<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Send + 'static> fmt::Debug for Context<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("key", &self.inner.key)
            .field("role", &self.inner.role)
            .field("session_id", &self.inner.session_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Parameters for [`Context::new`].
pub(crate) struct ContextParts<M: Send + 'static> {
    pub(crate) endpoint: Endpoint<M>,
    pub(crate) format: Arc<dyn MessageFormat<M>>,
    pub(crate) handler: Arc<dyn MessageHandler<M>>,
    pub(crate) key: String,
    pub(crate) destination: SocketAddr,
    pub(crate) role: Role,
    pub(crate) buffer_size: usize,
}

impl<M: Send + 'static> Context<M> {
    /// Build a context in `Opening` together with its queue receiver.
    pub(crate) fn new(parts: ContextParts<M>) -> (Self, mpsc::Receiver<Outbound>) {
        let (queue, queue_rx) = mpsc::channel(parts.buffer_size.max(1));
        let throttles = Throttles::from_criteria(parts.endpoint.config.throttling.as_ref());
        let (state, _) = watch::channel(ContextState::Opening);
        let (app_quit, _) = watch::channel(false);
        let (net_quit, _) = watch::channel(false);

        let context = Self {
            inner: Arc::new(ContextInner {
                endpoint: parts.endpoint,
                format: parts.format,
                handler: parts.handler,
                key: Arc::from(parts.key),
                destination: parts.destination,
                role: parts.role,
                session_id: Uuid::new_v4(),
                queue,
                throttles,
                state,
                app_quit,
                net_quit,
                opened_fired: AtomicBool::new(false),
                closing_fired: AtomicBool::new(false),
            }),
        };
        (context, queue_rx)
    }

    /// Identity key, `"{id}-{address}:{port}-{transport}"`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Endpoint configuration this context was created from.
    #[must_use]
    pub fn endpoint(&self) -> &EndpointConfig {
        &self.inner.endpoint.config
    }

    /// Resolved remote address: the dialed destination or the accepted peer.
    #[must_use]
    pub fn destination(&self) -> SocketAddr {
        self.inner.destination
    }

    /// Initiator or acceptor.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Random id correlating this context's log events.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContextState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ContextState> {
        self.inner.state.subscribe()
    }

    /// Queue `message` for delivery.
    ///
    /// Waits for the outbound throttle and for queue space. Never fails:
    /// every outcome, including shutdown and encoding errors, is reported
    /// through the returned promise.
    pub async fn send(&self, message: &M) -> Promise {
        let key = Arc::clone(&self.inner.key);
        if self.is_shutting_down() {
            return Promise::resolved(key, PromiseState::Cancelled);
        }

        let payload = match self.inner.format.encode(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %self.inner.key, error = %e, "Outbound message could not be encoded");
                return Promise::resolved(key, PromiseState::FailedSerialization);
            }
        };

        let promise = Promise::new(key, payload);
        let mut quit = self.inner.app_quit.subscribe();

        tokio::select! {
            biased;
            _ = shutdown_signalled(&mut quit) => {
                promise.transition(PromiseState::Cancelled);
                return promise;
            }
            _ = self.inner.throttles.admit_outbound(promise.payload().len()) => {}
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut quit) => None,
            permit = self.inner.queue.reserve() => permit.ok(),
        };
        let Some(permit) = permit else {
            promise.transition(PromiseState::Cancelled);
            return promise;
        };

        promise.transition(PromiseState::Queued);
        permit.send(Outbound {
            promise: promise.clone(),
            attempted: false,
        });
        trace!(key = %self.inner.key, promise_id = promise.id(), "Message queued");

        if let Some(timeout) = self.inner.endpoint.config.send_timeout {
            let deadline = promise.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        if deadline.expire() {
                            debug!(promise_id = deadline.id(), "Message not sent before deadline");
                        }
                    }
                    _ = deadline.wait() => {}
                }
            });
        }

        promise
    }

    /// Request shutdown. Idempotent and non-blocking.
    pub fn close(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_closable() {
                *state = ContextState::Closing;
                true
            } else {
                false
            }
        });
        self.inner.app_quit.send_replace(true);
        self.inner.net_quit.send_replace(true);

        if changed {
            debug!(
                key = %self.inner.key,
                session_id = %self.inner.session_id,
                "Context closing"
            );
        }
    }

    /// Wait until the context is `Closed` or `Failed`.
    pub async fn closed(&self) -> ContextState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(ContextState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    fn is_shutting_down(&self) -> bool {
        *self.inner.app_quit.borrow() || !self.state().is_closable()
    }

    /// Apply `next` if the lifecycle allows it.
    pub(crate) fn transition(&self, next: ContextState) -> bool {
        let applied = self.inner.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if applied {
            debug!(
                key = %self.inner.key,
                session_id = %self.inner.session_id,
                state = %next,
                "Context state changed"
            );
        }
        applied
    }

    async fn fire_opened(&self) {
        if self.inner.opened_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            key = %self.inner.key,
            session_id = %self.inner.session_id,
            role = %self.inner.role,
            "Context opened"
        );
        if let Some(handler) = &self.inner.endpoint.context_handler {
            handler.opened(self).await;
        }
    }

    async fn fire_closing(&self) {
        if !self.inner.opened_fired.load(Ordering::SeqCst)
            || self.inner.closing_fired.swap(true, Ordering::SeqCst)
        {
            return;
        }
        if let Some(handler) = &self.inner.endpoint.context_handler {
            handler.closing(self).await;
        }
    }
}

#[async_trait]
impl<M: Send + 'static> ManagedContext for Context<M> {
    fn key(&self) -> &str {
        &self.inner.key
    }

    fn endpoint_id(&self) -> &str {
        &self.inner.endpoint.config.id
    }

    fn role(&self) -> Role {
        self.inner.role
    }

    fn state(&self) -> ContextState {
        Context::state(self)
    }

    fn close(&self) {
        Context::close(self)
    }

    async fn closed(&self) -> ContextState {
        Context::closed(self).await
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Why a connection stopped pumping.
enum PumpExit {
    /// Shutdown requested.
    Quit,
    /// The transport failed or the peer went away.
    Lost,
}

/// Background task owning a context's queue and connections.
pub(crate) struct Session<M: Send + 'static> {
    context: Context<M>,
    queue: mpsc::Receiver<Outbound>,
    pending: Option<Outbound>,
    registry: Arc<Registry>,
    supervisor: Option<Supervisor>,
}

impl<M: Send + 'static> Session<M> {
    pub(crate) fn new(
        context: Context<M>,
        queue: mpsc::Receiver<Outbound>,
        registry: Arc<Registry>,
        supervisor: Option<Supervisor>,
    ) -> Self {
        Self {
            context,
            queue,
            pending: None,
            registry,
            supervisor,
        }
    }

    /// Run until the context is closed or fails for good.
    ///
    /// `first` is the already established connection, if any; without one
    /// the supervisor dials before anything is written.
    pub(crate) async fn run(mut self, first: Option<Connection>) {
        let mut next = first;
        let mut net_quit = self.context.inner.net_quit.subscribe();

        let terminal = loop {
            let connection = match next.take() {
                Some(connection) => connection,
                None => {
                    let Some(supervisor) = self.supervisor.as_mut() else {
                        break ContextState::Closed;
                    };
                    match supervisor.reconnect(&self.context.inner.key, &mut net_quit).await {
                        Reconnect::Connected(connection) => connection,
                        Reconnect::Exhausted => break ContextState::Failed,
                        Reconnect::Cancelled => break ContextState::Closed,
                    }
                }
            };

            if !self.context.transition(ContextState::Open)
                && self.context.state() != ContextState::Open
            {
                // closed while the connection was being established
                break ContextState::Closed;
            }

            match self.pump(connection).await {
                PumpExit::Quit => break ContextState::Closed,
                PumpExit::Lost => {
                    let reconnect = self.supervisor.as_ref().is_some_and(Supervisor::enabled);
                    if reconnect && self.context.transition(ContextState::Reconnecting) {
                        warn!(
                            key = %self.context.inner.key,
                            session_id = %self.context.inner.session_id,
                            "Connection lost, reconnecting"
                        );
                        continue;
                    }
                    break ContextState::Closed;
                }
            }
        };

        self.finalize(terminal).await;
    }

    /// Drive one connection until shutdown or loss.
    async fn pump(&mut self, connection: Connection) -> PumpExit {
        let Connection {
            peer,
            mut sink,
            stream,
        } = connection;
        let inner = Arc::clone(&self.context.inner);
        debug!(key = %inner.key, peer = %peer, "Connection pump started");

        let (lost_tx, mut lost_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(self.context.clone(), stream, lost_tx));

        let mut app_quit = inner.app_quit.subscribe();
        let mut net_quit = inner.net_quit.subscribe();

        let exit = loop {
            let mut outbound = match self.pending.take() {
                Some(outbound) => outbound,
                None => tokio::select! {
                    biased;
                    _ = shutdown_signalled(&mut app_quit) => break PumpExit::Quit,
                    _ = &mut lost_rx => break PumpExit::Lost,
                    next = self.queue.recv() => match next {
                        Some(outbound) => outbound,
                        None => break PumpExit::Quit,
                    },
                },
            };

            if !outbound.promise.claim() {
                // resolved while waiting in the queue
                continue;
            }

            let frame = outbound.promise.payload().clone();
            let written = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut net_quit) => None,
                written = sink.send_frame(frame) => Some(written),
            };

            match written {
                Some(Ok(())) => {
                    outbound.promise.transition(PromiseState::Sent);
                    trace!(key = %inner.key, promise_id = outbound.promise.id(), "Message sent");
                }
                Some(Err(e)) => {
                    warn!(key = %inner.key, peer = %peer, error = %e, "Transport write failed");
                    outbound.promise.release();
                    outbound.attempted = true;
                    self.pending = Some(outbound);
                    break PumpExit::Lost;
                }
                None => {
                    outbound.promise.release();
                    self.pending = Some(outbound);
                    break PumpExit::Quit;
                }
            }
        };

        reader.abort();
        let _ = reader.await;
        let _ = tokio::time::timeout(SINK_CLOSE_GRACE, sink.close()).await;
        drop(sink);
        debug!(key = %inner.key, peer = %peer, "Connection pump stopped");
        exit
    }

    /// Resolve leftovers, fire `closing`, release the key, go terminal.
    async fn finalize(mut self, terminal: ContextState) {
        let context = self.context.clone();
        if terminal == ContextState::Closed {
            context.transition(ContextState::Closing);
        }
        context.inner.app_quit.send_replace(true);
        context.inner.net_quit.send_replace(true);

        if let Some(outbound) = self.pending.take() {
            if outbound.attempted {
                outbound.promise.transition(PromiseState::FailedTransport);
            }
        }
        self.queue.close();
        while let Ok(outbound) = self.queue.try_recv() {
            drop(outbound);
        }

        context.fire_closing().await;
        self.registry.remove(context.inner.role, &context.inner.key);

        let failures = self.supervisor.as_ref().map_or(0, Supervisor::failures);
        if !(terminal == ContextState::Failed && context.transition(ContextState::Failed)) {
            context.transition(ContextState::Closed);
        }
        info!(
            key = %context.inner.key,
            session_id = %context.inner.session_id,
            state = %context.state(),
            failures,
            "Context finished"
        );
    }
}

/// Read worker: decode inbound frames and dispatch them in order.
async fn read_loop<M: Send + 'static>(
    context: Context<M>,
    mut stream: Box<dyn FrameStream>,
    lost: oneshot::Sender<()>,
) {
    context.fire_opened().await;
    let inner = Arc::clone(&context.inner);
    let mut net_quit = inner.net_quit.subscribe();

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut net_quit) => return,
            next = stream.next_frame() => next,
        };

        match next {
            Ok(Some(frame)) => {
                inner.throttles.admit_inbound(frame.len()).await;
                match inner.format.decode(&frame) {
                    Ok(message) => inner.handler.on_message(&context, message).await,
                    Err(e) => {
                        warn!(key = %inner.key, len = frame.len(), error = %e, "Inbound frame dropped");
                    }
                }
            }
            Ok(None) => {
                debug!(key = %inner.key, "Peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(key = %inner.key, error = %e, "Transport read failed");
                break;
            }
        }
    }
    let _ = lost.send(());
}

/// Spawn the session of a freshly built context.
pub(crate) fn spawn_session<M: Send + 'static>(
    context: Context<M>,
    queue: mpsc::Receiver<Outbound>,
    registry: Arc<Registry>,
    supervisor: Option<Supervisor>,
    first: Option<Connection>,
) {
    let session = Session::new(context, queue, registry, supervisor);
    tokio::spawn(session.run(first));
}
