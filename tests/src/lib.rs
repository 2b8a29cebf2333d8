//! # Wire Bus Test Suite
//!
//! Cross-component scenarios that drive the bus end to end.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs     # Message type, collecting handlers, helpers
//!     ├── delivery.rs     # Ordering, promise outcomes, throttling
//!     ├── lifecycle.rs    # Dial, close, handler callbacks
//!     ├── reconnect.rs    # Supervisor behaviour against the in-memory hub
//!     ├── serving.rs      # Serve / stop ordering and error callbacks
//!     └── transports.rs   # Loopback tcp, udp and ws round trips
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p bus-tests
//! cargo test -p bus-tests integration::reconnect::
//! ```

#![allow(dead_code)]

pub mod integration;
