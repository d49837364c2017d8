//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Configure (graceful.rs, strategy.rs):
//!     Listener strategies → apply → (server, build fn, serve fn, cleanup fn)
//!
//! Run (graceful.rs):
//!     one server per listener (rebuilt after the first run) → serve concurrently
//!     first serve error or token cancellation → shutdown
//!
//! Shutdown (graceful.rs, hooks.rs, shutdown.rs):
//!     before hooks → drain every server (deadline) → after hooks
//!
//! Close (graceful.rs):
//!     shutdown → cleanup fns (socket files, descriptors)
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → cancel the run token
//! ```
//!
//! # Design Decisions
//! - Servers are tracked from apply on, so a shutdown racing a starting run still reaches them
//! - Shutdown takes the tracked servers, so repeated calls are no-ops
//! - Hook and drain failures are collected; every step runs regardless

pub mod graceful;
pub mod hooks;
pub mod shutdown;
pub mod signals;
pub mod strategy;

pub use graceful::{Graceful, GracefulBuilder, Timeouts, DEFAULT_ADDR, DEFAULT_SHUTDOWN_TIMEOUT};
pub use hooks::{BoxError, Hook, HookError, Hooks, Phase};
pub use shutdown::{ContextError, DrainError, ShutdownContext, ShutdownError};
pub use strategy::{Applied, Listener};
