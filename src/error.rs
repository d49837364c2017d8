//! Crate-wide error type.

use std::path::PathBuf;

use thiserror::Error;

use crate::lifecycle::shutdown::ShutdownError;

/// Errors produced while configuring, running or stopping a [`Graceful`](crate::Graceful).
#[derive(Debug, Error)]
pub enum Error {
    /// `start` was called while a previous `start` has no matching `stop`.
    #[error("already started router")]
    AlreadyStarted,

    /// `stop` was called without a preceding `start`.
    #[error("router not started")]
    NotStarted,

    /// The manager was closed and cannot be used again.
    #[error("router closed")]
    Closed,

    /// A serve loop stopped because its server was shut down.
    ///
    /// This is the benign outcome of every serve function.
    #[error("server closed")]
    ServerClosed,

    /// The caller's cancellation token fired before the servers finished.
    #[error("context canceled")]
    Canceled,

    /// A preconfigured-server strategy was applied without a server.
    #[error("nil http server")]
    NilServer,

    /// Failed to bind a TCP address or Unix socket path.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to adopt an inherited file descriptor as a listener.
    #[error("failed to adopt file descriptor {fd}: {source}")]
    Descriptor {
        fd: i32,
        #[source]
        source: std::io::Error,
    },

    /// The certificate or private key could not be loaded.
    #[error("failed to load TLS certificate {cert:?} with key {key:?}: {source}")]
    Tls {
        cert: PathBuf,
        key: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Accepting a connection failed with a non-recoverable error.
    #[error("accept failed on {address}: {source}")]
    Accept {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A listener bound at configuration time was already served once and closed.
    #[error("listener {0} is already closed")]
    ListenerClosed(String),

    /// The strategy is not available on this platform.
    #[error("{0} listeners are not supported on this platform")]
    Unsupported(&'static str),

    /// Hooks or server drains failed during shutdown.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    /// A serve task panicked or was aborted.
    #[error("serve task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
