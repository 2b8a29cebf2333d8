//! Accept loop of a served endpoint.

use crate::domain::{identity_key, Endpoint, TransportKind};
use crate::error::{BusError, TransportError};
use crate::ports::{Connection, Listener, MessageFormat, MessageHandler};
use crate::service::bus::{notify, ResultFn};
use crate::service::context::{spawn_session, Context, ContextParts};
use crate::service::registry::{Registry, Role};
use crate::service::supervisor::shutdown_signalled;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Everything needed to turn accepted connections into contexts.
pub(crate) struct AcceptLoop<M: Send + 'static> {
    pub(crate) registry: Arc<Registry>,
    pub(crate) endpoint: Endpoint<M>,
    pub(crate) format: Arc<dyn MessageFormat<M>>,
    pub(crate) handler: Arc<dyn MessageHandler<M>>,
    pub(crate) kind: TransportKind,
    pub(crate) buffer_size: usize,
    pub(crate) on_error: Option<ResultFn>,
}

impl<M: Send + 'static> AcceptLoop<M> {
    /// Accept until `shutdown` is raised, then hand the listener back.
    ///
    /// The listener stays bound so the caller can close contexts first.
    pub(crate) async fn run(
        self,
        mut listener: Box<dyn Listener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Box<dyn Listener> {
        let endpoint_id = self.endpoint.config.id.clone();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(connection) => self.open(connection),
                Err(TransportError::Closed) => {
                    debug!(endpoint_id = %endpoint_id, "Listener closed underneath the accept loop");
                    break;
                }
                Err(e) => {
                    warn!(endpoint_id = %endpoint_id, error = %e, "Accept failed");
                    notify(
                        self.on_error.as_ref(),
                        self.endpoint.config.clone(),
                        BusError::Transport(e),
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown_signalled(&mut shutdown) => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        debug!(endpoint_id = %endpoint_id, "Accept loop stopped");
        listener
    }

    /// Register and start an acceptor context for `connection`.
    fn open(&self, connection: Connection) {
        let key = identity_key(&self.endpoint.config.id, connection.peer, self.kind);
        let reservation = match self.registry.reserve(Role::Acceptor, &key) {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping duplicate inbound connection");
                return;
            }
        };

        let (context, queue) = Context::new(ContextParts {
            endpoint: self.endpoint.clone(),
            format: Arc::clone(&self.format),
            handler: Arc::clone(&self.handler),
            key,
            destination: connection.peer,
            role: Role::Acceptor,
            buffer_size: self.buffer_size,
        });
        reservation.insert(Arc::new(context.clone()));
        spawn_session(
            context,
            queue,
            Arc::clone(&self.registry),
            None,
            Some(connection),
        );
    }
}
