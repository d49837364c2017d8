//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted connection (TCP, Unix, or TLS over either)
//!     → server.rs (hyper auto builder: HTTP/1.1 or HTTP/2)
//!     → read / write timeout layers
//!     → shared axum Router
//!     → Send to client
//! ```

pub mod server;

pub use server::{
    Server, ServerSpec, ServerTimeouts, DEFAULT_IDLE_TIMEOUT, DEFAULT_READ_HEADER_TIMEOUT,
    DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT,
};
