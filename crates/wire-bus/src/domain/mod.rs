//! # Domain Layer
//!
//! Pure connection-runtime types: endpoint configuration and identity,
//! lifecycle states, the leaky-bucket throttle and the promise pipeline.

pub mod endpoint;
pub mod promise;
pub mod state;
pub mod throttle;

pub use endpoint::{
    identity_key, Endpoint, EndpointConfig, ReconnectPolicy, ThrottleStrategy,
    ThrottlingCriteria, TransportKind,
};
pub use promise::{Promise, PromiseState};
pub use state::ContextState;
pub use throttle::{LeakyBucket, Throttles};
