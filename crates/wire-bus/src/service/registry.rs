//! # Registry
//!
//! Keyed collections of live contexts and active listeners.
//!
//! ## Invariants
//!
//! - At most one entry per identity key and role; a key is claimed by
//!   [`Registry::reserve`] before the transport is dialed, so concurrent
//!   dials with the same key yield exactly one success
//! - A claim lives in a [`Reservation`]; dropping it uncommitted (an error
//!   return or a cancelled future) releases the key
//! - Lookups only return contexts that were inserted and not yet removed
//! - Bulk operations work on snapshots taken under the read lock; the lock
//!   is never held while a context or listener is being closed

use crate::domain::{ContextState, EndpointConfig};
use crate::error::BusError;
use crate::ports::Listener;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Which side of a connection a context represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Created by `dial`.
    Initiator,
    /// Created by a listener's accept loop.
    Acceptor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => f.write_str("initiator"),
            Self::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Type-erased view of a context, as held by the registry.
#[async_trait]
pub trait ManagedContext: Send + Sync {
    /// Identity key.
    fn key(&self) -> &str;

    /// Identifier of the endpoint the context belongs to.
    fn endpoint_id(&self) -> &str;

    /// Initiator or acceptor.
    fn role(&self) -> Role;

    /// Current lifecycle state.
    fn state(&self) -> ContextState;

    /// Request shutdown. Idempotent, does not wait.
    fn close(&self);

    /// Wait for a terminal state.
    async fn closed(&self) -> ContextState;
}

enum Entry {
    Reserved,
    Live(Arc<dyn ManagedContext>),
}

/// Handle on a running accept loop.
pub(crate) struct ListenerHandle {
    pub(crate) config: EndpointConfig,
    pub(crate) local_addr: SocketAddr,
    pub(crate) shutdown: watch::Sender<bool>,
    /// Resolves to the listener once the accept loop has stopped.
    pub(crate) task: JoinHandle<Box<dyn Listener>>,
}

enum ListenerSlot {
    /// Binding in progress.
    Reserved,
    Active(ListenerHandle),
    /// Shutdown in progress.
    Stopping(SocketAddr),
}

#[derive(Default)]
struct RegistryState {
    initiators: HashMap<String, Entry>,
    acceptors: HashMap<String, Entry>,
    listeners: HashMap<String, ListenerSlot>,
}

impl RegistryState {
    fn contexts(&self, role: Role) -> &HashMap<String, Entry> {
        match role {
            Role::Initiator => &self.initiators,
            Role::Acceptor => &self.acceptors,
        }
    }

    fn contexts_mut(&mut self, role: Role) -> &mut HashMap<String, Entry> {
        match role {
            Role::Initiator => &mut self.initiators,
            Role::Acceptor => &mut self.acceptors,
        }
    }
}

enum Claim {
    Context(Role, String),
    Listener(String),
}

/// Claim on an identity key or listener id.
///
/// Released on drop unless committed with [`Reservation::insert`] or
/// `activate`.
#[must_use = "a reservation is released as soon as it is dropped"]
pub struct Reservation<'a> {
    registry: &'a Registry,
    claim: Claim,
    committed: bool,
}

impl fmt::Debug for Reservation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = match &self.claim {
            Claim::Context(_, key) | Claim::Listener(key) => key,
        };
        f.debug_struct("Reservation")
            .field("key", key)
            .field("committed", &self.committed)
            .finish()
    }
}

impl Reservation<'_> {
    /// Publish `context` under the reserved key.
    ///
    /// The context's own key must be the reserved one.
    pub fn insert(mut self, context: Arc<dyn ManagedContext>) {
        if let Claim::Context(role, key) = &self.claim {
            debug_assert_eq!(key, context.key());
            self.registry.insert(*role, context);
            self.committed = true;
        }
    }

    /// Attach a running accept loop to the reserved listener id.
    pub(crate) fn activate(mut self, handle: ListenerHandle) {
        if let Claim::Listener(endpoint_id) = &self.claim {
            self.registry.activate_listener(endpoint_id, handle);
            self.committed = true;
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match &self.claim {
            Claim::Context(role, key) => {
                self.registry.remove(*role, key);
            }
            Claim::Listener(endpoint_id) => {
                self.registry.release_listener(endpoint_id);
                debug!(endpoint_id = %endpoint_id, "Listener reservation released");
            }
        }
    }
}

/// Live contexts by identity key, listeners by endpoint id.
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Registry")
            .field("initiators", &state.initiators.len())
            .field("acceptors", &state.acceptors.len())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for a context that is about to be established.
    pub fn reserve(&self, role: Role, key: &str) -> Result<Reservation<'_>, BusError> {
        let mut state = self.state.write();
        let contexts = state.contexts_mut(role);
        if contexts.contains_key(key) {
            return Err(BusError::EndpointAlreadyRegistered(key.to_string()));
        }
        contexts.insert(key.to_string(), Entry::Reserved);
        debug!(key, %role, "Identity key reserved");
        Ok(Reservation {
            registry: self,
            claim: Claim::Context(role, key.to_string()),
            committed: false,
        })
    }

    /// Publish a context under its key.
    pub(crate) fn insert(&self, role: Role, context: Arc<dyn ManagedContext>) {
        let key = context.key().to_string();
        self.state
            .write()
            .contexts_mut(role)
            .insert(key, Entry::Live(context));
    }

    /// Live context registered under `key`.
    #[must_use]
    pub fn lookup(&self, role: Role, key: &str) -> Option<Arc<dyn ManagedContext>> {
        match self.state.read().contexts(role).get(key) {
            Some(Entry::Live(context)) => Some(Arc::clone(context)),
            _ => None,
        }
    }

    /// Whether `key` is reserved or live.
    #[must_use]
    pub fn contains(&self, role: Role, key: &str) -> bool {
        self.state.read().contexts(role).contains_key(key)
    }

    /// Release `key`. Returns whether it was present.
    pub fn remove(&self, role: Role, key: &str) -> bool {
        let removed = self.state.write().contexts_mut(role).remove(key).is_some();
        if removed {
            debug!(key, %role, "Identity key released");
        }
        removed
    }

    /// Live contexts of `role` at this instant.
    #[must_use]
    pub fn snapshot(&self, role: Role) -> Vec<Arc<dyn ManagedContext>> {
        self.state
            .read()
            .contexts(role)
            .values()
            .filter_map(|entry| match entry {
                Entry::Live(context) => Some(Arc::clone(context)),
                Entry::Reserved => None,
            })
            .collect()
    }

    /// Live acceptor contexts spawned by the listener of `endpoint_id`.
    #[must_use]
    pub fn acceptors_for(&self, endpoint_id: &str) -> Vec<Arc<dyn ManagedContext>> {
        self.snapshot(Role::Acceptor)
            .into_iter()
            .filter(|context| context.endpoint_id() == endpoint_id)
            .collect()
    }

    /// Number of reserved or live keys for `role`.
    #[must_use]
    pub fn len(&self, role: Role) -> usize {
        self.state.read().contexts(role).len()
    }

    /// Whether no context, reservation or listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let state = self.state.read();
        state.initiators.is_empty() && state.acceptors.is_empty() && state.listeners.is_empty()
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Claim `endpoint_id` for a listener about to be bound.
    pub(crate) fn reserve_listener(&self, endpoint_id: &str) -> Result<Reservation<'_>, BusError> {
        let mut state = self.state.write();
        if state.listeners.contains_key(endpoint_id) {
            return Err(BusError::EndpointAlreadyRegistered(endpoint_id.to_string()));
        }
        state
            .listeners
            .insert(endpoint_id.to_string(), ListenerSlot::Reserved);
        Ok(Reservation {
            registry: self,
            claim: Claim::Listener(endpoint_id.to_string()),
            committed: false,
        })
    }

    fn activate_listener(&self, endpoint_id: &str, handle: ListenerHandle) {
        self.state
            .write()
            .listeners
            .insert(endpoint_id.to_string(), ListenerSlot::Active(handle));
    }

    /// Move an active listener into shutdown and hand out its handle.
    pub(crate) fn begin_listener_shutdown(&self, endpoint_id: &str) -> Option<ListenerHandle> {
        let mut state = self.state.write();
        let slot = state.listeners.get_mut(endpoint_id)?;
        let local_addr = match slot {
            ListenerSlot::Active(handle) => handle.local_addr,
            ListenerSlot::Reserved | ListenerSlot::Stopping(_) => return None,
        };
        match std::mem::replace(slot, ListenerSlot::Stopping(local_addr)) {
            ListenerSlot::Active(handle) => Some(handle),
            _ => None,
        }
    }

    /// Forget a listener id.
    pub(crate) fn release_listener(&self, endpoint_id: &str) {
        self.state.write().listeners.remove(endpoint_id);
    }

    /// Ids of listeners currently accepting.
    #[must_use]
    pub fn listener_ids(&self) -> Vec<String> {
        self.state
            .read()
            .listeners
            .iter()
            .filter(|(_, slot)| matches!(slot, ListenerSlot::Active(_)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Configurations of listeners currently accepting.
    pub(crate) fn listener_configs(&self) -> Vec<EndpointConfig> {
        self.state
            .read()
            .listeners
            .values()
            .filter_map(|slot| match slot {
                ListenerSlot::Active(handle) => Some(handle.config.clone()),
                _ => None,
            })
            .collect()
    }

    /// Bound address of the listener serving `endpoint_id`.
    #[must_use]
    pub fn listener_addr(&self, endpoint_id: &str) -> Option<SocketAddr> {
        match self.state.read().listeners.get(endpoint_id)? {
            ListenerSlot::Active(handle) => Some(handle.local_addr),
            ListenerSlot::Stopping(addr) => Some(*addr),
            ListenerSlot::Reserved => None,
        }
    }
}
