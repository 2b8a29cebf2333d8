//! # Bus Facade
//!
//! Entry points of the runtime: dial, serve, stop serving, stop.
//!
//! ## Shutdown order
//!
//! Stopping a listener first stops its accept loop, then closes every
//! context it accepted and waits for them to reach a terminal state, and
//! only then closes the listener itself. Application code therefore always
//! observes its contexts closing while the listener is still bound.

use crate::adapters::{default_transports, resolver};
use crate::config::BusConfig;
use crate::domain::{identity_key, ContextState, Endpoint, EndpointConfig, TransportKind};
use crate::error::BusError;
use crate::ports::{DialOptions, Listener, Transport};
use crate::service::acceptor::AcceptLoop;
use crate::service::context::{spawn_session, Context, ContextParts};
use crate::service::registry::{ListenerHandle, ManagedContext, Registry, Role};
use crate::service::supervisor::Supervisor;
use futures_util::future::join_all;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Callback receiving per-endpoint errors from `serve` and the stop
/// operations. Invoked from a spawned task, never inline.
pub type ResultFn = Arc<dyn Fn(&EndpointConfig, BusError) + Send + Sync>;

lazy_static! {
    static ref GLOBAL_BUS: Bus = Bus::with_config(BusConfig::from_env());
}

/// Report `error` for `config` through `callback`, or log it if absent.
pub(crate) fn notify(callback: Option<&ResultFn>, config: EndpointConfig, error: BusError) {
    match callback {
        Some(callback) => {
            let callback = Arc::clone(callback);
            tokio::spawn(async move { callback(&config, error) });
        }
        None => warn!(endpoint_id = %config.id, error = %error, "Unreported endpoint error"),
    }
}

/// Messaging runtime: transports, registry and configuration.
pub struct Bus {
    registry: Arc<Registry>,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    config: BusConfig,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.transports.keys().map(TransportKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("Bus")
            .field("transports", &kinds)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// Bus with default configuration and the tcp, udp and ws transports.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Bus with `config` and the tcp, udp and ws transports.
    #[must_use]
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            transports: default_transports(&config),
            config,
        }
    }

    /// Register (or replace) the adapter for `kind`.
    #[must_use]
    pub fn with_transport(mut self, kind: TransportKind, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(kind, transport);
        self
    }

    /// Process-wide instance, configured from the environment.
    pub fn global() -> &'static Bus {
        &GLOBAL_BUS
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Registry of live contexts and listeners.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Live context registered under `key`, initiator or acceptor.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Arc<dyn ManagedContext>> {
        self.registry
            .lookup(Role::Initiator, key)
            .or_else(|| self.registry.lookup(Role::Acceptor, key))
    }

    /// Bound address of the listener serving `endpoint_id`.
    #[must_use]
    pub fn listener_addr(&self, endpoint_id: &str) -> Option<SocketAddr> {
        self.registry.listener_addr(endpoint_id)
    }

    fn adapter(&self, kind: TransportKind) -> Result<Arc<dyn Transport>, BusError> {
        self.transports
            .get(&kind)
            .cloned()
            .ok_or_else(|| BusError::InvalidTransport(kind.to_string()))
    }

    // =========================================================================
    // DIAL
    // =========================================================================

    /// Connect to `endpoint` and return its context.
    ///
    /// Fails without leaving anything registered when the endpoint is
    /// incomplete, resolution fails, the identity key is taken, or the
    /// connection cannot be established and reconnection is disabled. With
    /// reconnection enabled a failed first attempt is handed to the
    /// reconnect supervisor and the context is returned in `Opening`.
    pub async fn dial<M: Send + 'static>(&self, endpoint: Endpoint<M>) -> Result<Context<M>, BusError> {
        let (format, handler) = endpoint.behaviors()?;
        let kind = endpoint.config.validate_destination()?;
        let transport = self.adapter(kind)?;
        let destination = resolver::resolve(&endpoint.config).await?;
        let key = identity_key(&endpoint.config.id, destination, kind);

        let reservation = self.registry.reserve(Role::Initiator, &key)?;

        let options = DialOptions {
            host: (!endpoint.config.fqdn.is_empty()).then(|| endpoint.config.fqdn.clone()),
            origin: endpoint.config.origin.clone(),
            resource_path: endpoint.config.resource_path.clone(),
        };
        let mut supervisor = Supervisor::new(
            transport,
            destination,
            options,
            endpoint.config.reconnect,
            self.config.connect_timeout,
        );

        let first = match supervisor.connect_once().await {
            Ok(connection) => Some(connection),
            Err(e) if !supervisor.enabled() => {
                warn!(key = %key, error = %e, "Dial failed");
                return Err(e.into());
            }
            Err(e) => {
                supervisor.record_failure();
                warn!(key = %key, attempt = 1, error = %e, "Dial failed, reconnect supervisor engaged");
                None
            }
        };

        let buffer_size = self.config.buffer_size_for(endpoint.config.buffer_size);
        let (context, queue) = Context::new(ContextParts {
            endpoint,
            format,
            handler,
            key,
            destination,
            role: Role::Initiator,
            buffer_size,
        });
        if first.is_some() {
            context.transition(ContextState::Open);
        }

        reservation.insert(Arc::new(context.clone()));
        spawn_session(
            context.clone(),
            queue,
            Arc::clone(&self.registry),
            Some(supervisor),
            first,
        );

        info!(
            key = %context.key(),
            session_id = %context.session_id(),
            state = %context.state(),
            "Dialed endpoint"
        );
        Ok(context)
    }

    // =========================================================================
    // SERVE
    // =========================================================================

    /// Start a listener for each endpoint.
    ///
    /// Returns once every listener is bound (or has failed); accept loops
    /// run in the background. Failures are delivered to `on_error`.
    pub async fn serve<M, I>(&self, on_error: Option<ResultFn>, endpoints: I)
    where
        M: Send + 'static,
        I: IntoIterator<Item = Endpoint<M>>,
    {
        for endpoint in endpoints {
            let config = endpoint.config.clone();
            if let Err(e) = self.serve_endpoint(endpoint, on_error.clone()).await {
                warn!(endpoint_id = %config.id, error = %e, "Failed to serve endpoint");
                notify(on_error.as_ref(), config, e);
            }
        }
    }

    async fn serve_endpoint<M: Send + 'static>(
        &self,
        endpoint: Endpoint<M>,
        on_error: Option<ResultFn>,
    ) -> Result<(), BusError> {
        let (format, handler) = endpoint.behaviors()?;
        if endpoint.config.id.is_empty() {
            return Err(BusError::MissingDestinationInfo);
        }
        let kind = endpoint
            .config
            .transport
            .ok_or(BusError::MissingDestinationInfo)?;
        let transport = self.adapter(kind)?;
        let addr = resolver::resolve(&endpoint.config).await?;

        let endpoint_id = endpoint.config.id.clone();
        let reservation = self.registry.reserve_listener(&endpoint_id)?;
        let listener = transport.bind(addr).await?;
        let local_addr = listener.local_addr();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = endpoint.config.clone();
        let accept_loop = AcceptLoop {
            registry: Arc::clone(&self.registry),
            buffer_size: self.config.buffer_size_for(endpoint.config.buffer_size),
            endpoint,
            format,
            handler,
            kind,
            on_error,
        };
        let task = tokio::spawn(accept_loop.run(listener, shutdown_rx));

        reservation.activate(ListenerHandle {
            config,
            local_addr,
            shutdown,
            task,
        });
        info!(endpoint_id = %endpoint_id, local = %local_addr, transport = %kind, "Serving endpoint");
        Ok(())
    }

    // =========================================================================
    // STOP
    // =========================================================================

    /// Stop the listeners of `endpoints` and close the contexts they accepted.
    ///
    /// Endpoints that are not being served are reported as `NotServing`.
    pub async fn stop_serving(&self, on_error: Option<ResultFn>, endpoints: &[EndpointConfig]) {
        let errors = self.shutdown_listeners(endpoints.to_vec()).await;
        for (config, error) in errors {
            notify(on_error.as_ref(), config, error);
        }
    }

    /// Stop every listener and close every acceptor context.
    pub async fn stop_serving_all(&self) {
        let errors = self
            .shutdown_listeners(self.registry.listener_configs())
            .await;
        for (config, error) in errors {
            warn!(endpoint_id = %config.id, error = %error, "Listener shutdown failed");
        }
    }

    /// Stop serving and close every initiator context as well.
    pub async fn stop(&self, on_error: Option<ResultFn>) {
        let errors = self
            .shutdown_listeners(self.registry.listener_configs())
            .await;
        for (config, error) in errors {
            notify(on_error.as_ref(), config, error);
        }

        let initiators = self.registry.snapshot(Role::Initiator);
        let count = initiators.len();
        close_all(&initiators).await;
        info!(initiators = count, "Bus stopped");
    }

    async fn shutdown_listeners(&self, targets: Vec<EndpointConfig>) -> Vec<(EndpointConfig, BusError)> {
        let mut errors = Vec::new();
        let mut stopping = Vec::new();

        for config in targets {
            match self.registry.begin_listener_shutdown(&config.id) {
                Some(handle) => {
                    handle.shutdown.send_replace(true);
                    stopping.push((config, handle.task));
                }
                None => {
                    let id = config.id.clone();
                    errors.push((config, BusError::NotServing(id)));
                }
            }
        }

        // accept loops have exited once their tasks resolve, so the
        // acceptor snapshot below is complete
        let mut listeners: Vec<(EndpointConfig, Option<Box<dyn Listener>>)> = Vec::new();
        for (config, task) in stopping {
            match task.await {
                Ok(listener) => listeners.push((config, Some(listener))),
                Err(e) => {
                    let reason = e.to_string();
                    let id = config.id.clone();
                    errors.push((config.clone(), BusError::ListenerShutdown { id, reason }));
                    listeners.push((config, None));
                }
            }
        }

        let contexts: Vec<_> = listeners
            .iter()
            .flat_map(|(config, _)| self.registry.acceptors_for(&config.id))
            .collect();
        debug!(contexts = contexts.len(), "Closing acceptor contexts");
        close_all(&contexts).await;

        for (config, listener) in listeners {
            if let Some(mut listener) = listener {
                listener.close().await;
            }
            self.registry.release_listener(&config.id);
            info!(endpoint_id = %config.id, "Stopped serving endpoint");
        }

        errors
    }
}

/// Close `contexts` and wait until all of them are terminal.
async fn close_all(contexts: &[Arc<dyn ManagedContext>]) {
    for context in contexts {
        context.close();
    }
    join_all(contexts.iter().map(|context| context.closed())).await;
}
