//! Health endpoint reporting accepting-state and open pipe count

use crate::error::Error;
use crate::server::ServerState;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Serialize)]
struct Status {
    accepting: bool,
    open: usize,
}

/// HTTP reporter for load balancers and liveness probes.
///
/// Any GET path returns the same JSON body; the status code is 503 once the
/// server stops accepting.
pub struct HealthServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthServer {
    pub async fn bind(
        addr: SocketAddr,
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
            state,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> Result<(), Error> {
        info!(addr = %self.local_addr, "Health endpoint listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, _peer)) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |_req| {
                                let state = Arc::clone(&state);
                                async move {
                                    debug!("Handled health check");
                                    Ok::<_, std::convert::Infallible>(status_response(&state))
                                }
                            });

                            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(error = %e, "Health connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept health connection"),
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn status_response(state: &ServerState) -> Response<Full<Bytes>> {
    let status = Status {
        accepting: state.accepting(),
        open: state.open_pipes(),
    };
    let code = if status.accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::to_string(&status).unwrap_or_else(|_| {
        format!(
            r#"{{"accepting":{},"open":{}}}"#,
            status.accepting, status.open
        )
    });

    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with static header parts")
}
