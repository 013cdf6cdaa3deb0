//! Front TCP listener: accept, provision a backend, dial it, run the pipe

use crate::backend::BackendFactory;
use crate::error::Error;
use crate::pipe::{self, Director, READ_HEARTBEAT};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Budget for obtaining a backend from the factory
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for establishing the connection to the backend
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long shutdown waits for active pipes to finish
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared accepting flag and live pipe counter, also read by the health
/// endpoint
pub struct ServerState {
    accepting: AtomicBool,
    open: AtomicUsize,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            accepting: AtomicBool::new(false),
            open: AtomicUsize::new(0),
        }
    }

    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn open_pipes(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn pipe_opened(&self) {
        self.open.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn pipe_closed(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything the pipe can treat as a backend byte stream
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// The session-oriented front door.
///
/// Every accepted connection gets its own backend: the factory provisions
/// one, the server dials it, and a pipe relays bytes until either side ends.
pub struct TcpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    factory: Arc<dyn BackendFactory>,
    state: Arc<ServerState>,
    shutdown_rx: watch::Receiver<bool>,
    director: Option<Director>,
    tls_acceptor: Option<TlsAcceptor>,
    remote_tls: Option<TlsConnector>,
    acquire_timeout: Duration,
    dial_timeout: Duration,
    drain_timeout: Duration,
    heartbeat: Duration,
}

impl TcpServer {
    /// Bind the front listener. Bind failures are fatal to the caller.
    pub async fn bind(
        addr: SocketAddr,
        factory: Arc<dyn BackendFactory>,
        state: Arc<ServerState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await.map_err(|e| Error::ListenerBind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| Error::ListenerBind {
            addr: addr.to_string(),
            source: e,
        })?;

        Ok(Self {
            listener,
            local_addr,
            factory,
            state,
            shutdown_rx,
            director: None,
            tls_acceptor: None,
            remote_tls: None,
            acquire_timeout: ACQUIRE_TIMEOUT,
            dial_timeout: DIAL_TIMEOUT,
            drain_timeout: DRAIN_TIMEOUT,
            heartbeat: READ_HEARTBEAT,
        })
    }

    /// Wrap accepted connections with TLS
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Dial backends through this TLS connector instead of plain TCP
    pub fn with_remote_tls(mut self, connector: TlsConnector) -> Self {
        self.remote_tls = Some(connector);
        self
    }

    /// Install a filter applied to client-to-backend chunks
    pub fn with_director(mut self, director: Director) -> Self {
        self.director = Some(director);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// The bound address, useful when binding port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown channel fires, then drain active pipes
    pub async fn run(self) -> Result<(), Error> {
        let protocol = if self.tls_acceptor.is_some() {
            "tcp+tls"
        } else {
            "tcp"
        };
        info!(addr = %self.local_addr, protocol, "Listening for client connections");
        self.state.set_accepting(true);

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let handler = self.conn_handler();
                        let tls_acceptor = self.tls_acceptor.clone();
                        tokio::spawn(async move {
                            match tls_acceptor {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(tls_stream) => handler.handle(tls_stream, peer).await,
                                    Err(e) => {
                                        debug!(peer = %peer, error = %e, "TLS handshake failed")
                                    }
                                },
                                None => handler.handle(stream, peer).await,
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.state.set_accepting(false);
        info!(addr = %self.local_addr, "Stopped accepting connections");
        self.drain().await;
        Ok(())
    }

    fn conn_handler(&self) -> ConnHandler {
        ConnHandler {
            factory: Arc::clone(&self.factory),
            state: Arc::clone(&self.state),
            shutdown_rx: self.shutdown_rx.clone(),
            director: self.director.clone(),
            remote_tls: self.remote_tls.clone(),
            acquire_timeout: self.acquire_timeout,
            dial_timeout: self.dial_timeout,
            heartbeat: self.heartbeat,
        }
    }

    /// Wait for active pipes to deregister; abandon whatever is left after
    /// the drain budget, their sockets close with the process.
    async fn drain(&self) {
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while self.state.open_pipes() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        if drained.is_err() {
            let e = Error::ShutdownTimeout {
                open: self.state.open_pipes(),
            };
            warn!(error = %e, "Abandoning undrained pipes");
        }
    }
}

/// Everything one connection task needs, detached from the server
struct ConnHandler {
    factory: Arc<dyn BackendFactory>,
    state: Arc<ServerState>,
    shutdown_rx: watch::Receiver<bool>,
    director: Option<Director>,
    remote_tls: Option<TlsConnector>,
    acquire_timeout: Duration,
    dial_timeout: Duration,
    heartbeat: Duration,
}

impl ConnHandler {
    async fn handle<S>(self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_id = Uuid::new_v4().to_string();
        info!(peer = %peer, conn = %conn_id, "Incoming connection");

        // Returning early drops the client stream, which closes it.
        let backend = match tokio::time::timeout(self.acquire_timeout, self.factory.create()).await
        {
            Ok(Ok(backend)) => backend,
            Ok(Err(e)) => {
                warn!(conn = %conn_id, error = %e, "Failed to obtain backend");
                return;
            }
            Err(_) => {
                warn!(
                    conn = %conn_id,
                    timeout_secs = self.acquire_timeout.as_secs(),
                    "Timeout obtaining backend"
                );
                return;
            }
        };

        let target = match backend.target().await {
            Ok(target) => target,
            Err(e) => {
                warn!(conn = %conn_id, backend = backend.id(), error = %e, "Failed to resolve backend target");
                backend.terminate().await;
                return;
            }
        };

        let backend_conn = match dial(target, self.remote_tls.clone(), self.dial_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(conn = %conn_id, target = %target, error = %e, "Failed to establish backend connection");
                backend.terminate().await;
                return;
            }
        };

        info!(conn = %conn_id, backend = backend.id(), target = %target, "Starting pipe");
        self.state.pipe_opened();
        pipe::run(
            stream,
            backend_conn,
            backend,
            self.director.clone(),
            self.heartbeat,
            self.shutdown_rx.clone(),
            &conn_id,
        )
        .await;
        self.state.pipe_closed();
        info!(conn = %conn_id, "Pipe closed");
    }
}

/// Dial the backend, retrying immediately on failure until the budget runs
/// out. Gives a freshly started backend time to begin listening.
pub(crate) async fn dial(
    target: SocketAddr,
    tls: Option<TlsConnector>,
    budget: Duration,
) -> Result<Box<dyn AsyncStream>, Error> {
    let attempt = async {
        loop {
            let stream = match TcpStream::connect(target).await {
                Ok(stream) => stream,
                Err(_) => continue,
            };
            match &tls {
                None => return Box::new(stream) as Box<dyn AsyncStream>,
                Some(connector) => {
                    let name = rustls::pki_types::ServerName::IpAddress(target.ip().into());
                    match connector.connect(name, stream).await {
                        Ok(tls_stream) => return Box::new(tls_stream) as Box<dyn AsyncStream>,
                        Err(_) => continue,
                    }
                }
            }
        }
    };

    tokio::time::timeout(budget, attempt)
        .await
        .map_err(|_| Error::DialTimeout { target })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_starts_closed() {
        let state = ServerState::new();
        assert!(!state.accepting());
        assert_eq!(state.open_pipes(), 0);
    }

    #[test]
    fn test_state_counts_pipes() {
        let state = ServerState::new();
        state.pipe_opened();
        state.pipe_opened();
        assert_eq!(state.open_pipes(), 2);
        state.pipe_closed();
        assert_eq!(state.open_pipes(), 1);
    }

    #[tokio::test]
    async fn test_dial_times_out_on_closed_port() {
        // Port 1 is essentially never listening.
        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = dial(target, None, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(Error::DialTimeout { .. })));
    }

    #[tokio::test]
    async fn test_dial_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let result = dial(target, None, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }
}
