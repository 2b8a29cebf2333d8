//! Application callback ports.
//!
//! Invocation guarantees:
//!
//! - [`MessageHandler::on_message`] runs once per decoded inbound message,
//!   in the order the transport delivered them.
//! - [`ContextHandler::opened`] runs exactly once, when the context first
//!   reaches `Open`, before any message is dispatched.
//! - [`ContextHandler::closing`] runs exactly once for every context that
//!   reached `Open`, while it shuts down.

use crate::service::Context;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// Receives decoded inbound messages. Mandatory on every endpoint.
#[async_trait]
pub trait MessageHandler<M: Send + 'static>: Send + Sync {
    /// Handle one inbound message.
    async fn on_message(&self, context: &Context<M>, message: M);
}

/// Observes a context's lifecycle. Optional.
#[async_trait]
pub trait ContextHandler<M: Send + 'static>: Send + Sync {
    /// The context reached `Open` for the first time.
    async fn opened(&self, _context: &Context<M>) {}

    /// The context is shutting down.
    async fn closing(&self, _context: &Context<M>) {}
}

/// [`MessageHandler`] backed by an async closure.
pub struct FnHandler<M, F> {
    f: F,
    _message: PhantomData<fn(M)>,
}

/// Wrap `f` as a [`MessageHandler`].
///
/// ```rust,ignore
/// let handler = handler_fn(|ctx: Context<Ping>, ping: Ping| async move {
///     ctx.send(&Pong::from(ping)).await;
/// });
/// ```
pub fn handler_fn<M, F, Fut>(f: F) -> FnHandler<M, F>
where
    M: Send + 'static,
    F: Fn(Context<M>, M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler {
        f,
        _message: PhantomData,
    }
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for FnHandler<M, F>
where
    M: Send + 'static,
    F: Fn(Context<M>, M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_message(&self, context: &Context<M>, message: M) {
        (self.f)(context.clone(), message).await;
    }
}
