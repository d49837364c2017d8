//! HTTP server setup and lifecycle.
//!
//! # Responsibilities
//! - Bind an address or adopt a listener and run the accept loop
//! - Serve each connection with hyper (HTTP/1.1 and HTTP/2, optional TLS)
//! - Apply read, write, idle and read-header timeouts
//! - Stop accepting on shutdown, drain in-flight requests, and force-close
//!   whatever is still open when the shutdown deadline passes

use std::fmt;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use hyper::body::Incoming;
use hyper::{Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};

use crate::error::{Error, Result};
use crate::lifecycle::shutdown::{ContextError, DrainError, ShutdownContext};
use crate::net::connection::{
    ConnectionActivity, ConnectionGuard, ConnectionState, ConnectionTracker,
};
use crate::net::listener::{is_connection_error, is_resource_error, AcceptedStream, AsyncListener};
use crate::net::{tls, BoundListener};

/// Time allowed to receive a whole request when none is configured.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);
/// Time allowed to produce a response when none is configured.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Keep-alive idle timeout when none is configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Always applied to servers built by the manager (slow-header protection).
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Per-server timeouts. `None` disables the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerTimeouts {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
    pub idle: Option<Duration>,
    pub read_header: Option<Duration>,
}

impl ServerTimeouts {
    /// Timeouts for a manager-built server: zero falls back to the default and
    /// the read-header timeout is always set.
    pub fn with_defaults(read: Duration, write: Duration, idle: Duration) -> Self {
        let or_default = |value: Duration, default: Duration| {
            Some(if value.is_zero() { default } else { value })
        };
        Self {
            read: or_default(read, DEFAULT_READ_TIMEOUT),
            write: or_default(write, DEFAULT_WRITE_TIMEOUT),
            idle: or_default(idle, DEFAULT_IDLE_TIMEOUT),
            read_header: Some(DEFAULT_READ_HEADER_TIMEOUT),
        }
    }
}

/// A server assembled by the caller: address, optional TLS and its own timeouts.
///
/// The manager attaches the shared router when it builds the server.
#[derive(Clone)]
pub struct ServerSpec {
    pub addr: String,
    pub tls: Option<RustlsConfig>,
    pub timeouts: ServerTimeouts,
}

impl ServerSpec {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
            timeouts: ServerTimeouts::default(),
        }
    }

    pub fn with_tls(mut self, config: RustlsConfig) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn with_timeouts(mut self, timeouts: ServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl fmt::Debug for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSpec")
            .field("addr", &self.addr)
            .field("tls", &self.tls.is_some())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

/// One HTTP server bound to the shared router.
pub struct Server {
    address: String,
    handler: Router,
    timeouts: ServerTimeouts,
    builder: Builder<TokioExecutor>,
    /// Stops the accept loop and starts draining connections.
    closed: CancellationToken,
    /// Drops every connection that is still open.
    force: CancellationToken,
    connections: TaskTracker,
    tracker: ConnectionTracker,
}

impl Server {
    pub fn new(address: impl Into<String>, handler: Router, timeouts: ServerTimeouts) -> Self {
        Self {
            address: address.into(),
            handler: apply_timeouts(handler, &timeouts),
            builder: connection_builder(&timeouts),
            timeouts,
            closed: CancellationToken::new(),
            force: CancellationToken::new(),
            connections: TaskTracker::new(),
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeouts(&self) -> &ServerTimeouts {
        &self.timeouts
    }

    /// True once shutdown has been requested.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn open_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Bind the server's address and serve plain HTTP until shut down.
    ///
    /// Returns [`Error::ServerClosed`] after a shutdown.
    pub async fn listen_and_serve(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ServerClosed);
        }
        let listener = self.bind().await?;
        self.accept_loop(listener, None).await
    }

    /// Bind the server's address and serve HTTPS until shut down.
    pub async fn listen_and_serve_tls(&self, config: &RustlsConfig) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ServerClosed);
        }
        let listener = self.bind().await?;
        self.accept_loop(listener, Some(tls::acceptor(config))).await
    }

    /// Serve plain HTTP on a listener bound elsewhere.
    pub async fn serve(&self, listener: BoundListener) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ServerClosed);
        }
        let listener = listener.into_async().map_err(|source| Error::Accept {
            address: self.address.clone(),
            source,
        })?;
        self.accept_loop(listener, None).await
    }

    /// Stop accepting, then wait for open connections to finish or for `ctx` to end.
    ///
    /// When `ctx` ends first the remaining connections are dropped and the
    /// error reports how many there were.
    pub async fn shutdown(&self, ctx: &ShutdownContext) -> std::result::Result<(), DrainError> {
        self.closed.cancel();
        self.connections.close();

        tokio::select! {
            biased;
            _ = self.connections.wait() => {
                tracing::debug!(address = %self.address, "Server drained");
                Ok(())
            }
            _ = ctx.done() => {
                let open_connections = self.tracker.active_count();
                self.force.cancel();
                tracing::warn!(
                    address = %self.address,
                    open_connections,
                    "Drain deadline reached, closing remaining connections"
                );
                Err(DrainError {
                    address: self.address.clone(),
                    open_connections,
                    cause: ctx.err().unwrap_or(ContextError::DeadlineExceeded),
                })
            }
        }
    }

    async fn bind(&self) -> Result<AsyncListener> {
        AsyncListener::bind(&self.address)
            .await
            .map_err(|source| Error::Bind {
                address: self.address.clone(),
                source,
            })
    }

    async fn accept_loop(&self, listener: AsyncListener, tls: Option<TlsAcceptor>) -> Result<()> {
        // Drains wait for the listener to be dropped as well as for connections.
        let _accepting = self.connections.token();
        let local = listener.describe();
        tracing::info!(address = %local, tls = tls.is_some(), "Server listening");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(stream) => self.spawn_connection(stream, tls.clone()),
                Err(e) if is_connection_error(&e) => {
                    tracing::trace!(address = %local, error = %e, "Connection dropped during accept");
                }
                Err(e) if is_resource_error(&e) => {
                    tracing::warn!(address = %local, error = %e, "Accept failed, retrying");
                    tokio::select! {
                        _ = self.closed.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
                Err(source) => {
                    return Err(Error::Accept {
                        address: local,
                        source,
                    });
                }
            }
        }

        drop(listener);
        tracing::info!(address = %local, "Server stopped accepting");
        Err(Error::ServerClosed)
    }

    fn spawn_connection(&self, stream: AcceptedStream, tls: Option<TlsAcceptor>) {
        match stream {
            AcceptedStream::Tcp(io, peer) => self.spawn_io(io, peer.to_string(), tls),
            #[cfg(unix)]
            AcceptedStream::Unix(io) => self.spawn_io(io, "unix".to_string(), tls),
        }
    }

    fn spawn_io<IO>(&self, io: IO, peer: String, tls: Option<TlsAcceptor>)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection {
            guard: self.tracker.track(),
            peer,
            handler: self.handler.clone(),
            builder: self.builder.clone(),
            idle: self.timeouts.idle,
            handshake_timeout: self.timeouts.read_header.unwrap_or(DEFAULT_READ_HEADER_TIMEOUT),
            closed: self.closed.clone(),
            force: self.force.clone(),
        };
        tracing::trace!(connection_id = %connection.guard.id(), peer = %connection.peer, "Connection accepted");

        self.connections.spawn(async move {
            match tls {
                Some(acceptor) => connection.serve_tls(io, acceptor).await,
                None => connection.serve(io).await,
            }
        });
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("timeouts", &self.timeouts)
            .field("closed", &self.is_closed())
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

/// One accepted connection, owned by its task.
struct Connection {
    guard: ConnectionGuard,
    peer: String,
    handler: Router,
    builder: Builder<TokioExecutor>,
    idle: Option<Duration>,
    handshake_timeout: Duration,
    closed: CancellationToken,
    force: CancellationToken,
}

impl Connection {
    async fn serve_tls<IO>(self, io: IO, acceptor: TlsAcceptor)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handshake = tokio::time::timeout(self.handshake_timeout, acceptor.accept(io));
        let stream = tokio::select! {
            _ = self.closed.cancelled() => return,
            result = handshake => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!(peer = %self.peer, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(peer = %self.peer, "TLS handshake timed out");
                    return;
                }
            },
        };
        self.serve(stream).await
    }

    async fn serve<IO>(self, io: IO)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.guard.id();
        let activity = ConnectionActivity::new();

        let service = {
            let activity = activity.clone();
            let handler = self.handler.clone();
            hyper::service::service_fn(move |request: Request<Incoming>| {
                let in_flight = activity.begin();
                let handler = handler.clone();
                async move {
                    let response = handler.oneshot(request).await;
                    drop(in_flight);
                    response
                }
            })
        };

        let conn = self
            .builder
            .serve_connection_with_upgrades(TokioIo::new(io), service);
        tokio::pin!(conn);

        let idle_timer = tokio::time::sleep(self.idle.unwrap_or(DEFAULT_IDLE_TIMEOUT));
        tokio::pin!(idle_timer);
        let mut state = ConnectionState::Active;

        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(connection_id = %id, peer = %self.peer, error = %e, "Connection error");
                    }
                    break;
                }
                _ = self.force.cancelled() => {
                    tracing::debug!(connection_id = %id, peer = %self.peer, "Connection force-closed");
                    break;
                }
                _ = self.closed.cancelled(), if state == ConnectionState::Active => {
                    conn.as_mut().graceful_shutdown();
                    state = ConnectionState::Draining;
                }
                _ = &mut idle_timer, if state == ConnectionState::Active && self.idle.is_some() => {
                    let Some(idle) = self.idle else { continue };
                    match activity.idle_deadline(idle) {
                        Some(deadline) if deadline <= Instant::now() => {
                            tracing::trace!(connection_id = %id, "Connection idle, closing");
                            conn.as_mut().graceful_shutdown();
                            state = ConnectionState::Draining;
                        }
                        Some(deadline) => idle_timer.as_mut().reset(deadline),
                        None => idle_timer.as_mut().reset(Instant::now() + idle),
                    }
                }
            }
        }

        tracing::trace!(connection_id = %id, state = ?ConnectionState::Closed, "Connection finished");
    }
}

fn connection_builder(timeouts: &ServerTimeouts) -> Builder<TokioExecutor> {
    let mut builder = Builder::new(TokioExecutor::new());
    {
        let mut http1 = builder.http1();
        http1.timer(TokioTimer::new()).keep_alive(true);
        if let Some(read_header) = timeouts.read_header {
            http1.header_read_timeout(read_header);
        }
    }
    builder
}

/// Wrap the router with the body-read and response-write timeouts. A slow
/// handler is answered with 408.
fn apply_timeouts(handler: Router, timeouts: &ServerTimeouts) -> Router {
    let mut handler = handler;
    if let Some(write) = timeouts.write {
        handler = handler.layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, write));
    }
    if let Some(read) = timeouts.read {
        handler = handler.layer(RequestBodyTimeoutLayer::new(read));
    }
    handler
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[test]
    fn test_defaults_fill_zero_values() {
        let timeouts = ServerTimeouts::with_defaults(
            Duration::from_secs(25),
            Duration::ZERO,
            Duration::ZERO,
        );
        assert_eq!(timeouts.read, Some(Duration::from_secs(25)));
        assert_eq!(timeouts.write, Some(DEFAULT_WRITE_TIMEOUT));
        assert_eq!(timeouts.idle, Some(DEFAULT_IDLE_TIMEOUT));
        assert_eq!(timeouts.read_header, Some(DEFAULT_READ_HEADER_TIMEOUT));
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let server = Server::new(
            "127.0.0.1:0",
            Router::new().route("/", get(|| async { "ok" })),
            ServerTimeouts::default(),
        );

        let ctx = ShutdownContext::with_timeout(Duration::from_secs(1));
        assert!(server.shutdown(&ctx).await.is_ok());
        assert!(server.is_closed());
        assert!(matches!(server.listen_and_serve().await, Err(Error::ServerClosed)));
    }

    #[tokio::test]
    async fn test_serve_returns_closed_after_shutdown() {
        let server = std::sync::Arc::new(Server::new(
            "127.0.0.1:0",
            Router::new(),
            ServerTimeouts::default(),
        ));

        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.listen_and_serve().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        server
            .shutdown(&ShutdownContext::with_timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(matches!(serving.await.unwrap(), Err(Error::ServerClosed)));
    }

    #[tokio::test]
    async fn test_slow_handler_answers_408() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let timeouts = ServerTimeouts {
            write: Some(Duration::from_millis(100)),
            ..ServerTimeouts::default()
        };
        let handler = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let server = std::sync::Arc::new(Server::new(addr.to_string(), handler, timeouts));

        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener.into()).await }
        });

        let response = reqwest::get(format!("http://{addr}/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

        server
            .shutdown(&ShutdownContext::with_timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(matches!(serving.await.unwrap(), Err(Error::ServerClosed)));
    }

    #[tokio::test]
    async fn test_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let server = Server::new(addr.clone(), Router::new(), ServerTimeouts::default());
        match server.listen_and_serve().await {
            Err(Error::Bind { address, .. }) => assert_eq!(address, addr),
            other => panic!("expected bind error, got {other:?}"),
        }
    }
}
