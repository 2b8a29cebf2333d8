//! # Wire Bus
//!
//! Messaging runtime that carries schema-typed messages over TCP, UDP and
//! WebSocket connections.
//!
//! Every logical connection is a [`Context`]. Sending returns a [`Promise`]
//! that resolves once the message reached the transport, failed, timed out
//! or was cancelled. Contexts created by [`Bus::dial`] are re-dialed by a
//! reconnect supervisor when the endpoint's [`ReconnectPolicy`] asks for
//! it; contexts accepted by [`Bus::serve`] are closed together with their
//! listener.
//!
//! ## Architecture
//!
//! - **Domain Layer:** endpoints, lifecycle states, leaky-bucket throttles,
//!   the promise pipeline
//! - **Ports Layer:** transport, message format and handler traits
//! - **Service Layer:** contexts, sessions, supervisor, registry, facade
//! - **Adapters Layer:** tcp/udp/ws/in-process transports, json/bincode
//!   formats, destination resolution
//!
//! ## Example
//!
//! ```rust,no_run
//! use wire_bus::{handler_fn, Bus, Context, Endpoint, EndpointConfig, JsonFormat, TransportKind};
//!
//! # async fn run() -> Result<(), wire_bus::BusError> {
//! let bus = Bus::new();
//!
//! let echo = Endpoint::new(EndpointConfig::new("echo", TransportKind::Tcp).with_address("127.0.0.1", 7000))
//!     .with_format(JsonFormat::<String>::new())
//!     .with_handler(handler_fn(|ctx: Context<String>, msg: String| async move {
//!         ctx.send(&msg).await;
//!     }));
//! bus.serve(None, [echo.clone()]).await;
//!
//! let client = bus.dial(echo).await?;
//! let state = client.send(&"hello".to_string()).await.wait().await;
//! println!("delivery: {state}");
//!
//! bus.stop(None).await;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod service;

pub use adapters::{BincodeFormat, JsonFormat, MemEvent, MemoryTransport, TcpTransport, UdpTransport, WsTransport};
pub use config::BusConfig;
pub use domain::{
    identity_key, ContextState, Endpoint, EndpointConfig, LeakyBucket, Promise, PromiseState,
    ReconnectPolicy, ThrottleStrategy, ThrottlingCriteria, Throttles, TransportKind,
};
pub use error::{BusError, BusResult, FormatError, TransportError};
pub use ports::{
    handler_fn, Connection, ContextHandler, DialOptions, FnHandler, FrameSink, FrameStream,
    Listener, MessageFormat, MessageHandler, Transport,
};
pub use service::{Bus, Context, ManagedContext, Registry, Reservation, ResultFn, Role};
