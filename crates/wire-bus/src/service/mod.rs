//! # Service Layer
//!
//! Wires the domain to the ports: connection contexts and their sessions,
//! the reconnect supervisor, listener accept loops, the registry and the
//! [`Bus`] facade.

mod acceptor;
pub mod bus;
pub mod context;
pub mod registry;
mod supervisor;

pub use bus::{Bus, ResultFn};
pub use context::Context;
pub use registry::{ManagedContext, Registry, Reservation, Role};
