//! WebSocket front door: binary frames in, raw backend bytes out
//!
//! The WebSocket plays the client role of a pipe; the backend side is a
//! plain TCP dial. Heartbeat, director and teardown semantics match the TCP
//! front door.

use crate::backend::BackendFactory;
use crate::error::Error;
use crate::pipe::{Director, BUFFER_SIZE, READ_HEARTBEAT};
use crate::server::{dial, ServerState, ACQUIRE_TIMEOUT, DIAL_TIMEOUT, DRAIN_TIMEOUT};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket analog of the TCP front door
pub struct WsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    factory: Arc<dyn BackendFactory>,
    state: Arc<ServerState>,
    shutdown_rx: watch::Receiver<bool>,
    director: Option<Director>,
    acquire_timeout: Duration,
    dial_timeout: Duration,
    drain_timeout: Duration,
    heartbeat: Duration,
}

impl WsServer {
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
            acquire_timeout: ACQUIRE_TIMEOUT,
            dial_timeout: DIAL_TIMEOUT,
            drain_timeout: DRAIN_TIMEOUT,
            heartbeat: READ_HEARTBEAT,
        })
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

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> Result<(), Error> {
        info!(addr = %self.local_addr, "Listening for WebSocket connections");
        self.state.set_accepting(true);

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let factory = Arc::clone(&self.factory);
                        let state = Arc::clone(&self.state);
                        let shutdown = self.shutdown_rx.clone();
                        let director = self.director.clone();
                        let acquire_timeout = self.acquire_timeout;
                        let dial_timeout = self.dial_timeout;
                        let heartbeat = self.heartbeat;
                        tokio::spawn(async move {
                            handle_upgrade(
                                stream,
                                peer,
                                factory,
                                state,
                                shutdown,
                                director,
                                acquire_timeout,
                                dial_timeout,
                                heartbeat,
                            )
                            .await;
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
        info!(addr = %self.local_addr, "Stopped accepting WebSocket connections");

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

        Ok(())
    }
}

/// Upgrades are only served at the root path
fn require_root_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() != "/" {
        let mut rejection = ErrorResponse::new(Some("not found".to_string()));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        return Err(rejection);
    }
    Ok(response)
}

#[allow(clippy::too_many_arguments)]
async fn handle_upgrade(
    stream: TcpStream,
    peer: SocketAddr,
    factory: Arc<dyn BackendFactory>,
    state: Arc<ServerState>,
    shutdown_rx: watch::Receiver<bool>,
    director: Option<Director>,
    acquire_timeout: Duration,
    dial_timeout: Duration,
    heartbeat: Duration,
) {
    let websocket = match tokio_tungstenite::accept_hdr_async(stream, require_root_path).await {
        Ok(websocket) => websocket,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let conn_id = Uuid::new_v4().to_string();
    info!(peer = %peer, conn = %conn_id, "Incoming WebSocket connection");

    // Dropping the websocket on any early return closes the client side.
    let backend = match tokio::time::timeout(acquire_timeout, factory.create()).await {
        Ok(Ok(backend)) => backend,
        Ok(Err(e)) => {
            warn!(conn = %conn_id, error = %e, "Failed to obtain backend");
            return;
        }
        Err(_) => {
            warn!(
                conn = %conn_id,
                timeout_secs = acquire_timeout.as_secs(),
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

    let backend_conn = match dial(target, None, dial_timeout).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(conn = %conn_id, target = %target, error = %e, "Failed to establish backend connection");
            backend.terminate().await;
            return;
        }
    };

    info!(conn = %conn_id, backend = backend.id(), target = %target, "Starting WebSocket pipe");
    state.pipe_opened();

    let (ws_sink, ws_stream) = websocket.split();
    let (backend_read, backend_write) = tokio::io::split(backend_conn);

    let mut upstream = tokio::spawn(frames_to_stream(
        ws_stream,
        backend_write,
        director,
        heartbeat,
        shutdown_rx.clone(),
    ));
    let mut downstream = tokio::spawn(stream_to_frames(
        backend_read,
        ws_sink,
        heartbeat,
        shutdown_rx,
    ));

    tokio::select! {
        _ = &mut upstream => {
            downstream.abort();
            let _ = downstream.await;
        }
        _ = &mut downstream => {
            upstream.abort();
            let _ = upstream.await;
        }
    }

    debug!(conn = %conn_id, backend = backend.id(), "Closing WebSocket pipe");
    backend.terminate().await;
    state.pipe_closed();
    info!(conn = %conn_id, "WebSocket pipe closed");
}

/// Forward client frames to the backend stream, applying the director
async fn frames_to_stream<W>(
    mut frames: SplitStream<WebSocketStream<TcpStream>>,
    mut stream: W,
    director: Option<Director>,
    heartbeat: Duration,
    mut cancel: watch::Receiver<bool>,
) where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow_and_update() {
                    debug!(direction = "client->backend", "Pipe cancelled");
                    return;
                }
            }
            next = tokio::time::timeout(heartbeat, frames.next()) => {
                let message = match next {
                    // No frame within the deadline: still alive, keep going.
                    Err(_) => continue,
                    Ok(None) => {
                        debug!(direction = "client->backend", "WebSocket closed");
                        return;
                    }
                    Ok(Some(Err(e))) => {
                        debug!(direction = "client->backend", error = %e, "WebSocket read failed");
                        return;
                    }
                    Ok(Some(Ok(message))) => message,
                };

                match message {
                    Message::Binary(_) | Message::Text(_) => {
                        let mut chunk = message.into_data();
                        if let Some(filter) = &director {
                            filter(&mut chunk);
                        }
                        if let Err(e) = stream.write_all(&chunk).await {
                            debug!(direction = "client->backend", error = %e, "Write failed");
                            return;
                        }
                    }
                    Message::Close(_) => {
                        debug!(direction = "client->backend", "WebSocket close frame");
                        return;
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                }
            }
        }
    }
}

/// Forward backend bytes to the client as binary frames
async fn stream_to_frames<R>(
    mut stream: R,
    mut frames: SplitSink<WebSocketStream<TcpStream>, Message>,
    heartbeat: Duration,
    mut cancel: watch::Receiver<bool>,
) where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow_and_update() {
                    debug!(direction = "backend->client", "Pipe cancelled");
                    return;
                }
            }
            result = tokio::time::timeout(heartbeat, stream.read(&mut buf)) => {
                let n = match result {
                    Err(_) => continue,
                    Ok(Ok(0)) => {
                        debug!(direction = "backend->client", "Backend stream closed");
                        let _ = frames.send(Message::Close(None)).await;
                        return;
                    }
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        debug!(direction = "backend->client", error = %e, "Read failed");
                        return;
                    }
                };

                if let Err(e) = frames.send(Message::Binary(buf[..n].to_vec())).await {
                    debug!(direction = "backend->client", error = %e, "WebSocket send failed");
                    return;
                }
            }
        }
    }
}
