//! Graceful lifecycle management for HTTP servers.
//!
//! Runs any number of listeners (TCP addresses, TLS, Unix sockets, inherited
//! file descriptors, caller-bound listeners, caller-assembled servers) over a
//! single axum [`Router`](axum::Router) and shuts them down as one unit:
//! stop accepting, drain in-flight requests within a deadline, run hooks.
//!
//! # Architecture Overview
//!
//! ```text
//!   config ──▶ lifecycle::strategy ──▶ lifecycle::graceful ──▶ http::server ──▶ Router
//!                 (Listener)              (Graceful)              (Server)
//!                                             │
//!                         lifecycle::hooks ◀──┴──▶ lifecycle::shutdown
//!                                                  (ShutdownContext)
//!
//!   net: listeners, connection tracking, TLS          observability: logs, metrics
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use error::{Error, Result};
pub use http::{Server, ServerSpec, ServerTimeouts};
pub use lifecycle::{
    Graceful, GracefulBuilder, Hook, Listener, Phase, ShutdownContext, ShutdownError, Timeouts,
};
pub use net::BoundListener;
