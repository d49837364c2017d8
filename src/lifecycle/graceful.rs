//! The lifecycle manager.
//!
//! [`Graceful`] owns the shared router, the servers built from the applied
//! listener strategies, their serve and cleanup functions, and the shutdown
//! hooks. It runs every server as one unit and shuts them down together.
//!
//! # State
//! ```text
//! build ──apply──▶ configured ──run/start──▶ serving ──shutdown──▶ configured
//!                                                    └──close────▶ closed
//! ```
//!
//! Servers are built when their listener is applied, so a shutdown issued
//! before a run gets going still reaches them. Each later run builds fresh
//! replacements.
//!
//! One mutex guards the collections and the started flag. It is never held
//! across an `.await`; serving, draining and hooks work on snapshots.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::Request;
use axum::handler::Handler;
use axum::response::IntoResponse;
use axum::routing::{MethodRouter, Route};
use axum::Router;
use futures_util::future::join_all;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::config::{GracefulConfig, TimeoutConfig};
use crate::error::{Error, Result};
use crate::http::{Server, ServerTimeouts};
use crate::lifecycle::hooks::{BoxError, Hook, Hooks, Phase};
use crate::lifecycle::shutdown::{ShutdownContext, ShutdownError};
use crate::lifecycle::strategy::{Applied, BuildFn, Cleanup, Listener, ServeFn};
use crate::net::BoundListener;
use crate::observability::metrics;

/// Address served when `run` finds no listener configured.
pub const DEFAULT_ADDR: &str = ":8080";
/// Drain budget when none is configured.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configured timeouts. Zero means the built-in default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub shutdown: Duration,
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
}

impl Timeouts {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            shutdown: config.shutdown(),
            read: config.read(),
            write: config.write(),
            idle: config.idle(),
        }
    }
}

struct Started {
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

/// One applied listener and the server it serves next.
struct Entry {
    build: BuildFn,
    serve: ServeFn,
    server: Arc<Server>,
    /// Set once a run has taken `server`.
    claimed: bool,
}

#[derive(Default)]
struct Inner {
    started: Option<Started>,
    servers: Vec<Arc<Server>>,
    entries: Vec<Entry>,
    cleanups: Vec<Cleanup>,
    closed: bool,
}

impl Inner {
    fn push(&mut self, applied: Applied) {
        self.servers.push(Arc::clone(&applied.server));
        self.entries.push(Entry {
            build: applied.build,
            serve: applied.serve,
            server: applied.server,
            claimed: false,
        });
        self.cleanups.push(applied.cleanup);
    }
}

struct Shared {
    handler: RwLock<Router>,
    default_middleware: bool,
    inner: Mutex<Inner>,
    timeouts: Timeouts,
    hooks: Hooks,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for cleanup in std::mem::take(&mut inner.cleanups) {
            cleanup();
        }
    }
}

/// Runs a set of HTTP servers over one router and shuts them down gracefully.
///
/// Cloning is cheap; clones share the same state.
///
/// ```no_run
/// use axum::{routing::get, Router};
/// use graceful_router::{Graceful, Listener};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() -> graceful_router::Result<()> {
/// let graceful = Graceful::builder(Router::new().route("/", get(|| async { "hello" })))
///     .listener(Listener::addr("127.0.0.1:8080"))
///     .build()?;
///
/// let token = CancellationToken::new();
/// let result = graceful.run(token).await;
/// graceful.close().await;
/// result
/// # }
/// ```
#[derive(Clone)]
pub struct Graceful {
    shared: Arc<Shared>,
}

impl Graceful {
    /// A manager over `router` with default timeouts, no listeners and no hooks.
    pub fn new(router: Router) -> Self {
        Self::from_parts(router, false, Timeouts::default(), Hooks::new())
    }

    /// Like [`Graceful::new`], with request tracing and panic recovery applied
    /// to every server.
    pub fn with_defaults(router: Router) -> Self {
        Self::from_parts(router, true, Timeouts::default(), Hooks::new())
    }

    pub fn builder(router: Router) -> GracefulBuilder {
        GracefulBuilder::new(router)
    }

    /// Build a manager from a loaded configuration file.
    pub fn from_config(router: Router, config: &GracefulConfig) -> Result<Self> {
        Self::builder(router)
            .timeouts(Timeouts::from_config(&config.timeouts))
            .listeners(config.listeners.iter().map(Listener::from_config))
            .build()
    }

    fn from_parts(router: Router, default_middleware: bool, timeouts: Timeouts, hooks: Hooks) -> Self {
        Self {
            shared: Arc::new(Shared {
                handler: RwLock::new(router),
                default_middleware,
                inner: Mutex::new(Inner::default()),
                timeouts,
                hooks,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Router forwarding. Servers built afterwards see the change.

    pub fn route(&self, path: &str, method_router: MethodRouter) -> &Self {
        self.update_router(|router| router.route(path, method_router))
    }

    pub fn merge(&self, other: Router) -> &Self {
        self.update_router(|router| router.merge(other))
    }

    pub fn fallback<H, T>(&self, handler: H) -> &Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.update_router(|router| router.fallback(handler))
    }

    /// Wrap the routes registered so far, as [`Router::layer`] does.
    pub fn layer<L>(&self, layer: L) -> &Self
    where
        L: Layer<Route> + Clone + Send + Sync + 'static,
        L::Service: Service<Request> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse + 'static,
        <L::Service as Service<Request>>::Error: Into<Infallible> + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        self.update_router(|router| router.layer(layer))
    }

    /// The router new servers are built with.
    pub fn router(&self) -> Router {
        let router = self
            .shared
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if self.shared.default_middleware {
            router
                .layer(CatchPanicLayer::new())
                .layer(TraceLayer::new_for_http())
        } else {
            router
        }
    }

    fn update_router(&self, update: impl FnOnce(Router) -> Router) -> &Self {
        let mut handler = self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let current = std::mem::take(&mut *handler);
        *handler = update(current);
        self
    }

    /// Apply a listener strategy and track its server. Unix sockets and
    /// descriptors are bound now; the other strategies bind when serving starts.
    pub fn apply(&self, listener: Listener) -> Result<()> {
        if self.lock().closed {
            return Err(Error::Closed);
        }
        let applied = listener.apply(self)?;
        let mut inner = self.lock();
        if inner.closed {
            drop(inner);
            (applied.cleanup)();
            return Err(Error::Closed);
        }
        inner.push(applied);
        Ok(())
    }

    /// Pick the server each entry serves in the coming run.
    ///
    /// A server not yet taken by a run is served as is when a shutdown already
    /// closed it, so that run ends at once. Otherwise a fresh server replaces
    /// it, picking up routes added since it was built.
    fn prepare(&self, inner: &mut Inner) -> Result<Vec<(ServeFn, Arc<Server>)>> {
        if inner.closed {
            return Err(Error::Closed);
        }
        if inner.entries.is_empty() {
            let applied = Listener::addr(DEFAULT_ADDR).apply(self)?;
            tracing::info!(address = DEFAULT_ADDR, "No listener configured, using default");
            inner.push(applied);
        }

        let Inner { servers, entries, .. } = inner;
        let mut prepared = Vec::with_capacity(entries.len());
        for entry in entries.iter_mut() {
            if entry.claimed || !entry.server.is_closed() {
                let fresh = Arc::new((entry.build)(self));
                let tracked = servers
                    .iter()
                    .position(|server| Arc::ptr_eq(server, &entry.server));
                match tracked {
                    Some(index) if !entry.claimed => servers[index] = Arc::clone(&fresh),
                    _ => servers.push(Arc::clone(&fresh)),
                }
                entry.server = fresh;
            }
            entry.claimed = true;
            prepared.push((Arc::clone(&entry.serve), Arc::clone(&entry.server)));
        }
        Ok(prepared)
    }

    /// Serve on every applied listener until `token` is cancelled or a server fails.
    ///
    /// With no listener applied, one is added on [`DEFAULT_ADDR`]. Cancelling
    /// `token` shuts every server down within the shutdown timeout and returns
    /// [`Error::Canceled`]. The first serve error shuts the others down and is
    /// returned.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let prepared = self.prepare(&mut self.lock())?;
        self.serve_prepared(prepared, token).await
    }

    async fn serve_prepared(
        &self,
        prepared: Vec<(ServeFn, Arc<Server>)>,
        token: CancellationToken,
    ) -> Result<()> {
        let run_token = token.child_token();
        let mut tasks = JoinSet::new();
        for (serve, server) in prepared {
            tasks.spawn(serve(server));
        }

        let watcher = tokio::spawn({
            let graceful = self.clone();
            let run_token = run_token.clone();
            async move {
                run_token.cancelled().await;
                tracing::info!("Shutdown triggered");
                let ctx = ShutdownContext::with_timeout(graceful.shutdown_timeout());
                if let Err(e) = graceful.shutdown(&ctx).await {
                    tracing::error!(error = %e, "Graceful shutdown finished with errors");
                }
            }
        });

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(Error::Join(e)),
            };
            match result {
                Ok(()) | Err(Error::ServerClosed) => {}
                Err(e) => {
                    metrics::record_serve_error();
                    tracing::error!(error = %e, "Server failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                        run_token.cancel();
                    }
                }
            }
        }

        if run_token.is_cancelled() {
            // Wait for the drain and the after-shutdown hooks.
            if let Err(e) = watcher.await {
                tracing::error!(error = %e, "Shutdown task failed");
            }
        } else {
            watcher.abort();
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if token.is_cancelled() {
            return Err(Error::Canceled);
        }
        self.shutdown(&ShutdownContext::background()).await
    }

    /// Apply an address listener for each entry and run until shut down.
    pub async fn run_addr<I, S>(&self, addrs: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for addr in addrs {
            self.apply(Listener::addr(addr))?;
        }
        self.run(CancellationToken::new()).await
    }

    pub async fn run_tls(
        &self,
        addr: impl Into<String>,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> Result<()> {
        self.apply(Listener::tls(addr, cert, key))?;
        self.run(CancellationToken::new()).await
    }

    pub async fn run_unix(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.apply(Listener::unix(path))?;
        self.run(CancellationToken::new()).await
    }

    pub async fn run_fd(&self, fd: i32) -> Result<()> {
        self.apply(Listener::fd(fd))?;
        self.run(CancellationToken::new()).await
    }

    pub async fn run_listener(&self, listener: impl Into<BoundListener>) -> Result<()> {
        self.apply(Listener::listener(listener))?;
        self.run(CancellationToken::new()).await
    }

    /// Run in a background task and return immediately.
    ///
    /// The servers are tracked before this returns, so an immediate
    /// [`Graceful::shutdown`] stops them. Must be called from within a tokio
    /// runtime. Pair with [`Graceful::stop`].
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::Closed);
        }
        if inner.started.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let prepared = self.prepare(&mut inner)?;
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let graceful = self.clone();
            let token = token.clone();
            async move { graceful.serve_prepared(prepared, token).await }
        });
        inner.started = Some(Started { token, handle });
        tracing::debug!("Background run started");
        Ok(())
    }

    /// Stop a run begun by [`Graceful::start`] and wait for it to finish.
    pub async fn stop(&self) -> Result<()> {
        let started = self.lock().started.take().ok_or(Error::NotStarted)?;
        started.token.cancel();

        match started.handle.await {
            Ok(Ok(())) | Ok(Err(Error::Canceled)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::Join(e)),
        }
    }

    /// Drain every tracked server.
    ///
    /// Before-shutdown hooks run first, then all servers drain concurrently
    /// until `ctx` ends (the shutdown timeout applies when `ctx` has no
    /// deadline), then after-shutdown hooks run. Every step runs even when an
    /// earlier one failed. With no tracked server this is a no-op.
    pub async fn shutdown(&self, ctx: &ShutdownContext) -> Result<()> {
        let servers = std::mem::take(&mut self.lock().servers);
        if servers.is_empty() {
            return Ok(());
        }

        let ctx = ctx.or_timeout(self.shutdown_timeout());
        let started = std::time::Instant::now();
        tracing::info!(servers = servers.len(), timeout = ?ctx.remaining(), "Graceful shutdown started");

        let mut report = ShutdownError {
            before: self.shared.hooks.run(Phase::BeforeShutdown, &ctx).await,
            ..ShutdownError::default()
        };
        report.drain = join_all(servers.iter().map(|server| server.shutdown(&ctx)))
            .await
            .into_iter()
            .filter_map(|result| result.err())
            .collect();
        report.after = self.shared.hooks.run(Phase::AfterShutdown, &ctx).await;

        metrics::record_shutdown(started, report.is_empty());
        match report.into_result() {
            Ok(()) => {
                tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Graceful shutdown complete");
                Ok(())
            }
            Err(report) => {
                tracing::warn!(error = %report, "Graceful shutdown completed with errors");
                Err(report.into())
            }
        }
    }

    /// Shut down, then release every listener resource. The manager cannot
    /// be used afterwards. Calling it again does nothing.
    pub async fn close(&self) {
        if let Err(e) = self.shutdown(&ShutdownContext::background()).await {
            tracing::debug!(error = %e, "Shutdown during close failed");
        }
        self.release();
    }

    fn release(&self) {
        let cleanups = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.servers.clear();
            inner.entries.clear();
            std::mem::take(&mut inner.cleanups)
        };
        if !cleanups.is_empty() {
            tracing::debug!(count = cleanups.len(), "Running listener cleanups");
        }
        for cleanup in cleanups {
            cleanup();
        }
    }

    /// Point-in-time copy of the tracked servers: those applied or started
    /// since the last shutdown.
    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.lock().servers.clone()
    }

    /// Timeouts as configured, zero meaning default.
    pub fn timeouts(&self) -> Timeouts {
        self.shared.timeouts
    }

    /// Timeouts applied to servers the manager builds.
    pub fn server_timeouts(&self) -> ServerTimeouts {
        let timeouts = &self.shared.timeouts;
        ServerTimeouts::with_defaults(timeouts.read, timeouts.write, timeouts.idle)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        match self.shared.timeouts.shutdown {
            timeout if timeout.is_zero() => DEFAULT_SHUTDOWN_TIMEOUT,
            timeout => timeout,
        }
    }

    pub fn hooks(&self) -> &Hooks {
        &self.shared.hooks
    }

    pub fn is_started(&self) -> bool {
        self.lock().started.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl fmt::Debug for Graceful {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Graceful")
            .field("servers", &inner.servers.len())
            .field("listeners", &inner.entries.len())
            .field("started", &inner.started.is_some())
            .field("closed", &inner.closed)
            .field("timeouts", &self.shared.timeouts)
            .field("hooks", &self.shared.hooks)
            .finish()
    }
}

/// Builder for [`Graceful`].
pub struct GracefulBuilder {
    router: Router,
    default_middleware: bool,
    listeners: Vec<Listener>,
    timeouts: Timeouts,
    hooks: Hooks,
}

impl GracefulBuilder {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            default_middleware: false,
            listeners: Vec::new(),
            timeouts: Timeouts::default(),
            hooks: Hooks::new(),
        }
    }

    /// Add request tracing and panic recovery to every server.
    pub fn default_middleware(mut self) -> Self {
        self.default_middleware = true;
        self
    }

    pub fn listener(mut self, listener: Listener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn listeners(mut self, listeners: impl IntoIterator<Item = Listener>) -> Self {
        self.listeners.extend(listeners);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.shutdown = timeout;
        self
    }

    /// Read, write and idle timeouts for servers the manager builds.
    pub fn server_timeouts(mut self, read: Duration, write: Duration, idle: Duration) -> Self {
        self.timeouts.read = read;
        self.timeouts.write = write;
        self.timeouts.idle = idle;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn hook(mut self, phase: Phase, hook: Hook) -> Self {
        self.hooks.push(phase, hook);
        self
    }

    pub fn before_shutdown<F, Fut, E>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(ShutdownContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.hook(Phase::BeforeShutdown, Hook::new(name, func))
    }

    pub fn after_shutdown<F, Fut, E>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(ShutdownContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.hook(Phase::AfterShutdown, Hook::new(name, func))
    }

    /// Apply every listener in order. On the first failure the listeners
    /// already applied are released and the error is returned.
    pub fn build(self) -> Result<Graceful> {
        let graceful = Graceful::from_parts(self.router, self.default_middleware, self.timeouts, self.hooks);
        for listener in self.listeners {
            let kind = listener.kind();
            if let Err(e) = graceful.apply(listener) {
                tracing::error!(kind, error = %e, "Failed to apply listener");
                graceful.release();
                return Err(e);
            }
        }
        Ok(graceful)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{DEFAULT_IDLE_TIMEOUT, DEFAULT_READ_HEADER_TIMEOUT, DEFAULT_WRITE_TIMEOUT};

    #[test]
    fn test_effective_timeouts() {
        let graceful = Graceful::builder(Router::new())
            .server_timeouts(Duration::from_secs(3), Duration::ZERO, Duration::ZERO)
            .build()
            .unwrap();

        assert_eq!(graceful.shutdown_timeout(), DEFAULT_SHUTDOWN_TIMEOUT);
        assert_eq!(graceful.timeouts().read, Duration::from_secs(3));

        let effective = graceful.server_timeouts();
        assert_eq!(effective.read, Some(Duration::from_secs(3)));
        assert_eq!(effective.write, Some(DEFAULT_WRITE_TIMEOUT));
        assert_eq!(effective.idle, Some(DEFAULT_IDLE_TIMEOUT));
        assert_eq!(effective.read_header, Some(DEFAULT_READ_HEADER_TIMEOUT));
    }

    #[test]
    fn test_build_error_releases_applied_listeners() {
        let path = std::env::temp_dir().join(format!("graceful-build-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let result = Graceful::builder(Router::new())
            .listener(Listener::unix(&path))
            .listener(Listener::Server(None))
            .build();

        assert!(matches!(result, Err(Error::NilServer)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let graceful = Graceful::new(Router::new());
        assert!(matches!(graceful.stop().await, Err(Error::NotStarted)));
    }

    #[tokio::test]
    async fn test_shutdown_without_servers_skips_hooks() {
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let graceful = Graceful::builder(Router::new())
            .before_shutdown("flag", move |_ctx| {
                let flag = flag.clone();
                async move {
                    flag.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                }
            })
            .build()
            .unwrap();

        assert!(graceful.shutdown(&ShutdownContext::background()).await.is_ok());
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_use() {
        let graceful = Graceful::new(Router::new());
        graceful.close().await;
        graceful.close().await;

        assert!(graceful.is_closed());
        assert!(matches!(graceful.apply(Listener::addr(":0")), Err(Error::Closed)));
        assert!(matches!(graceful.run(CancellationToken::new()).await, Err(Error::Closed)));
        assert!(matches!(graceful.start(), Err(Error::Closed)));
    }
}
