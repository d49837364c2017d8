//! Listener strategies.
//!
//! A [`Listener`] describes how one server binds and accepts connections.
//! Applying it builds the server and registers nothing by itself; the
//! manager tracks the returned server, keeps the build and serve functions
//! for every `run`, and calls the cleanup once when it is closed.
//!
//! | Strategy | Bound at      | Cleanup                         |
//! |----------|---------------|---------------------------------|
//! | `Addr`   | serve         | none                            |
//! | `Tls`    | serve         | none                            |
//! | `Server` | serve         | none                            |
//! | `Unix`   | apply         | close listener, remove the file |
//! | `Fd`     | apply         | close listener and descriptor   |
//! | `Custom` | caller        | none                            |

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::config::ListenerConfig;
use crate::error::{Error, Result};
use crate::http::{Server, ServerSpec};
use crate::lifecycle::graceful::Graceful;
use crate::net::{tls, BoundListener};

/// Builds a server from the manager's current router and timeouts.
pub type BuildFn = Arc<dyn Fn(&Graceful) -> Server + Send + Sync>;

/// Serves one server until it is shut down.
pub type ServeFn = Arc<dyn Fn(Arc<Server>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Releases transport resources. Called exactly once.
pub type Cleanup = Box<dyn FnOnce() + Send>;

type ListenerSlot = Arc<Mutex<Option<BoundListener>>>;

/// The result of applying a [`Listener`].
pub struct Applied {
    /// Built at apply time so a shutdown issued before serving still reaches it.
    pub server: Arc<Server>,
    /// Builds a replacement for runs after the first.
    pub build: BuildFn,
    pub serve: ServeFn,
    pub cleanup: Cleanup,
}

impl fmt::Debug for Applied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Applied").field("server", &self.server).finish_non_exhaustive()
    }
}

/// How one server binds and accepts connections.
pub enum Listener {
    /// Plain HTTP on a TCP address (`":8080"` binds every IPv4 interface).
    Addr(String),
    /// HTTPS on a TCP address. The certificate and key are loaded when serving
    /// starts, so a bad pair is reported by `run`, not at construction.
    Tls {
        addr: String,
        cert: PathBuf,
        key: PathBuf,
    },
    /// A caller-assembled server. `None` is rejected when applied.
    Server(Option<ServerSpec>),
    /// HTTP over a Unix socket created at this path when applied.
    Unix(PathBuf),
    /// An inherited descriptor that is already listening. The manager takes
    /// ownership of the descriptor once it has been adopted.
    Fd(i32),
    /// A listener bound by the caller.
    Custom(BoundListener),
}

impl Listener {
    pub fn addr(addr: impl Into<String>) -> Self {
        Self::Addr(addr.into())
    }

    pub fn tls(addr: impl Into<String>, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self::Tls {
            addr: addr.into(),
            cert: cert.into(),
            key: key.into(),
        }
    }

    pub fn server(spec: ServerSpec) -> Self {
        Self::Server(Some(spec))
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    pub fn fd(fd: i32) -> Self {
        Self::Fd(fd)
    }

    pub fn listener(listener: impl Into<BoundListener>) -> Self {
        Self::Custom(listener.into())
    }

    pub fn from_config(config: &ListenerConfig) -> Self {
        match config {
            ListenerConfig::Addr { address } => Self::addr(address.clone()),
            ListenerConfig::Tls {
                address,
                cert_path,
                key_path,
            } => Self::tls(address.clone(), cert_path.clone(), key_path.clone()),
            ListenerConfig::Unix { path } => Self::unix(path.clone()),
            ListenerConfig::Fd { fd } => Self::fd(*fd),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Addr(_) => "addr",
            Self::Tls { .. } => "tls",
            Self::Server(_) => "server",
            Self::Unix(_) => "unix",
            Self::Fd(_) => "fd",
            Self::Custom(_) => "listener",
        }
    }

    /// Build the server for `graceful` along with its serve and cleanup functions.
    ///
    /// Unix sockets are created and descriptors adopted here, so their errors
    /// surface immediately. Nothing needs a runtime at this point.
    pub fn apply(self, graceful: &Graceful) -> Result<Applied> {
        let kind = self.kind();
        let (build, serve, cleanup) = match self {
            Self::Addr(addr) => {
                let serve: ServeFn =
                    Arc::new(|server: Arc<Server>| async move { server.listen_and_serve().await }.boxed());
                (build_on(addr), serve, noop())
            }

            Self::Tls { addr, cert, key } => {
                let serve: ServeFn = Arc::new(move |server: Arc<Server>| {
                    let (cert, key) = (cert.clone(), key.clone());
                    async move {
                        let config = tls::load_tls_config(&cert, &key).await?;
                        server.listen_and_serve_tls(&config).await
                    }
                    .boxed()
                });
                (build_on(addr), serve, noop())
            }

            Self::Server(None) => return Err(Error::NilServer),

            Self::Server(Some(spec)) => {
                let tls = spec.tls.clone();
                let build: BuildFn = Arc::new(move |graceful: &Graceful| {
                    Server::new(spec.addr.clone(), graceful.router(), spec.timeouts)
                });
                let serve: ServeFn = Arc::new(move |server: Arc<Server>| {
                    let tls = tls.clone();
                    async move {
                        match tls {
                            Some(config) => server.listen_and_serve_tls(&config).await,
                            None => server.listen_and_serve().await,
                        }
                    }
                    .boxed()
                });
                (build, serve, noop())
            }

            Self::Unix(path) => {
                let listener = bind_unix(&path)?;
                let (build, serve, slot) = serve_listener(listener);
                let cleanup: Cleanup = Box::new(move || {
                    release(&slot);
                    remove_socket_file(&path);
                });
                (build, serve, cleanup)
            }

            Self::Fd(fd) => {
                let (listener, descriptor) = adopt_fd(fd)?;
                let (build, serve, slot) = serve_listener(listener);
                let cleanup: Cleanup = Box::new(move || {
                    release(&slot);
                    drop(descriptor);
                    tracing::debug!(fd, "Descriptor closed");
                });
                (build, serve, cleanup)
            }

            Self::Custom(listener) => {
                let (build, serve, _slot) = serve_listener(listener);
                (build, serve, noop())
            }
        };

        let server = Arc::new(build(graceful));
        tracing::debug!(kind, address = %server.address(), "Listener strategy applied");
        Ok(Applied {
            server,
            build,
            serve,
            cleanup,
        })
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(addr) => f.debug_tuple("Addr").field(addr).finish(),
            Self::Tls { addr, cert, key } => f
                .debug_struct("Tls")
                .field("addr", addr)
                .field("cert", cert)
                .field("key", key)
                .finish(),
            Self::Server(spec) => f.debug_tuple("Server").field(spec).finish(),
            Self::Unix(path) => f.debug_tuple("Unix").field(path).finish(),
            Self::Fd(fd) => f.debug_tuple("Fd").field(fd).finish(),
            Self::Custom(listener) => f.debug_tuple("Custom").field(&listener.describe()).finish(),
        }
    }
}

fn noop() -> Cleanup {
    Box::new(|| {})
}

/// A manager-configured server on `address`.
fn build_on(address: String) -> BuildFn {
    Arc::new(move |graceful: &Graceful| {
        Server::new(address.clone(), graceful.router(), graceful.server_timeouts())
    })
}

/// Serve a listener bound ahead of time. The listener moves into the first
/// open server that serves it; later runs report it as closed.
fn serve_listener(listener: BoundListener) -> (BuildFn, ServeFn, ListenerSlot) {
    let label = listener.describe();
    let slot: ListenerSlot = Arc::new(Mutex::new(Some(listener)));
    let serve_slot = Arc::clone(&slot);

    let build = build_on(label.clone());
    let serve: ServeFn = Arc::new(move |server: Arc<Server>| {
        // A server shut down before it started leaves the listener for the next run.
        if server.is_closed() {
            return async { Err(Error::ServerClosed) }.boxed();
        }
        let taken = serve_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let label = label.clone();
        match taken {
            Some(listener) => async move { server.serve(listener).await }.boxed(),
            None => async move { Err(Error::ListenerClosed(label)) }.boxed(),
        }
    });
    (build, serve, slot)
}

fn release(slot: &ListenerSlot) {
    drop(slot.lock().unwrap_or_else(PoisonError::into_inner).take());
}

#[cfg(unix)]
fn bind_unix(path: &Path) -> Result<BoundListener> {
    BoundListener::bind_unix(path).map_err(|source| Error::Bind {
        address: path.display().to_string(),
        source,
    })
}

#[cfg(not(unix))]
fn bind_unix(_path: &Path) -> Result<BoundListener> {
    Err(Error::Unsupported("unix"))
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Socket file removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file"),
    }
}

/// Wrap a listening descriptor. Returns the listener (on a duplicate) and the
/// original descriptor, which stays open until cleanup.
#[cfg(unix)]
fn adopt_fd(fd: i32) -> Result<(BoundListener, std::os::fd::OwnedFd)> {
    use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};

    let descriptor_error = |source: io::Error| Error::Descriptor { fd, source };
    if fd < 0 {
        return Err(descriptor_error(io::Error::new(
            io::ErrorKind::InvalidInput,
            "negative file descriptor",
        )));
    }

    // SAFETY: fd is non-negative and only borrowed for the duplication; a
    // descriptor that is not open fails here with EBADF.
    let duplicate = unsafe { BorrowedFd::borrow_raw(fd) }
        .try_clone_to_owned()
        .map_err(descriptor_error)?;
    let listener = BoundListener::from_fd(duplicate).map_err(descriptor_error)?;

    // SAFETY: the descriptor was just duplicated, so it is open, and the
    // caller hands its ownership to the manager with this strategy.
    let original = unsafe { OwnedFd::from_raw_fd(fd) };
    tracing::info!(fd, address = %listener.describe(), "Descriptor adopted");
    Ok((listener, original))
}

#[cfg(not(unix))]
fn adopt_fd(_fd: i32) -> Result<(BoundListener, std::fs::File)> {
    Err(Error::Unsupported("fd"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;

    fn manager() -> Graceful {
        Graceful::new(Router::new())
    }

    #[test]
    fn test_nil_server_rejected() {
        assert!(matches!(Listener::Server(None).apply(&manager()), Err(Error::NilServer)));
    }

    #[cfg(unix)]
    #[test]
    fn test_negative_fd_rejected() {
        assert!(matches!(
            Listener::fd(-1).apply(&manager()),
            Err(Error::Descriptor { fd: -1, .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_closed_fd_rejected() {
        let err = Listener::fd(9_999).apply(&manager()).err();
        match err {
            Some(Error::Descriptor { fd, source }) => {
                assert_eq!(fd, 9_999);
                assert_eq!(source.raw_os_error(), Some(9));
            }
            other => panic!("expected descriptor error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_bind_error() {
        let path = PathBuf::from("/nonexistent-dir/graceful.sock");
        assert!(matches!(
            Listener::unix(&path).apply(&manager()),
            Err(Error::Bind { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_cleanup_removes_socket() {
        let path = std::env::temp_dir().join(format!("graceful-strategy-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let applied = Listener::unix(&path).apply(&manager()).unwrap();
        assert_eq!(applied.server.address(), path.display().to_string());
        assert!(path.exists());

        (applied.cleanup)();
        assert!(!path.exists());
        // A second removal of a missing file is not an error.
        remove_socket_file(&path);
    }

    #[tokio::test]
    async fn test_closed_server_leaves_listener_for_next_run() {
        use crate::lifecycle::ShutdownContext;
        use std::time::Duration;

        let graceful = manager();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let applied = Listener::listener(listener).apply(&graceful).unwrap();
        assert_eq!(applied.server.address(), addr.to_string());

        let ctx = ShutdownContext::with_timeout(Duration::from_secs(1));
        applied.server.shutdown(&ctx).await.unwrap();
        assert!(matches!(
            (applied.serve)(Arc::clone(&applied.server)).await,
            Err(Error::ServerClosed)
        ));

        let replacement = Arc::new((applied.build)(&graceful));
        let serving = tokio::spawn((applied.serve)(Arc::clone(&replacement)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

        replacement.shutdown(&ctx).await.unwrap();
        assert!(matches!(serving.await.unwrap(), Err(Error::ServerClosed)));
        assert!(matches!(
            (applied.serve)(Arc::new((applied.build)(&graceful))).await,
            Err(Error::ListenerClosed(_))
        ));
    }

    #[test]
    fn test_from_config() {
        let listener = Listener::from_config(&ListenerConfig::Tls {
            address: ":8443".into(),
            cert_path: "cert.pem".into(),
            key_path: "key.pem".into(),
        });
        assert_eq!(listener.kind(), "tls");
        assert!(format!("{listener:?}").contains(":8443"));

        let listener = Listener::from_config(&ListenerConfig::Fd { fd: 3 });
        assert!(matches!(listener, Listener::Fd(3)));
    }
}
