//! Listener abstraction over TCP and Unix sockets.
//!
//! # Responsibilities
//! - Hold listeners bound at configuration time (std sockets, no runtime needed)
//! - Adopt inherited file descriptors, detecting TCP vs Unix
//! - Convert to tokio listeners when serving starts
//! - Accept connections and classify accept errors
//!
//! # Design Decisions
//! - Configuration-time binding stays synchronous so strategies can be applied
//!   before a runtime exists; registration with the reactor happens on serve
//! - A ":port" address means every IPv4 interface, an empty address port 80

use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::OwnedFd;
#[cfg(unix)]
use std::path::Path;

use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Expand the short address forms into something `bind` accepts.
pub fn normalize_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.is_empty() {
        "0.0.0.0:80".to_string()
    } else if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    }
}

/// A listening socket that has not been handed to the runtime yet.
#[derive(Debug)]
pub enum BoundListener {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

impl BoundListener {
    /// Create the socket file at `path` and listen on it.
    #[cfg(unix)]
    pub fn bind_unix(path: &Path) -> io::Result<Self> {
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        tracing::info!(path = %path.display(), "Unix listener bound");
        Ok(Self::Unix(listener))
    }

    /// Adopt an owned descriptor that is already listening.
    #[cfg(unix)]
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let tcp = std::net::TcpListener::from(fd);
        if tcp.local_addr().is_ok() {
            return Ok(Self::Tcp(tcp));
        }

        let unix = std::os::unix::net::UnixListener::from(OwnedFd::from(tcp));
        unix.local_addr()?;
        Ok(Self::Unix(unix))
    }

    /// Human readable local address, used in logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Self::Tcp(listener) => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp".to_string()),
            #[cfg(unix)]
            Self::Unix(listener) => listener
                .local_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix".to_string()),
        }
    }

    /// Register with the tokio reactor. Must be called inside a runtime.
    pub fn into_async(self) -> io::Result<AsyncListener> {
        match self {
            Self::Tcp(listener) => {
                listener.set_nonblocking(true)?;
                Ok(AsyncListener::Tcp(TcpListener::from_std(listener)?))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                listener.set_nonblocking(true)?;
                Ok(AsyncListener::Unix(UnixListener::from_std(listener)?))
            }
        }
    }
}

impl From<std::net::TcpListener> for BoundListener {
    fn from(listener: std::net::TcpListener) -> Self {
        Self::Tcp(listener)
    }
}

#[cfg(unix)]
impl From<std::os::unix::net::UnixListener> for BoundListener {
    fn from(listener: std::os::unix::net::UnixListener) -> Self {
        Self::Unix(listener)
    }
}

/// A listener registered with the runtime.
#[derive(Debug)]
pub enum AsyncListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// An accepted connection.
#[derive(Debug)]
pub enum AcceptedStream {
    Tcp(TcpStream, SocketAddr),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncListener {
    /// Bind a TCP address, accepting the `:port` shorthand.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(normalize_addr(addr)).await?;
        tracing::info!(address = %listener.local_addr()?, "Listener bound");
        Ok(Self::Tcp(listener))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Tcp(listener) => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp".to_string()),
            #[cfg(unix)]
            Self::Unix(listener) => listener
                .local_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix".to_string()),
        }
    }

    pub async fn accept(&self) -> io::Result<AcceptedStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                // Best effort: small responses should not wait for Nagle.
                let _ = stream.set_nodelay(true);
                Ok(AcceptedStream::Tcp(stream, peer))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(AcceptedStream::Unix(stream))
            }
        }
    }
}

/// Errors that only affect the connection being accepted.
pub(crate) fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Resource exhaustion (EMFILE / ENFILE): worth retrying after a pause.
pub(crate) fn is_resource_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(23) | Some(24))
}
