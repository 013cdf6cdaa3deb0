//! Per-connection bidirectional byte relay
//!
//! Each direction runs as its own task with a read deadline that doubles as
//! a heartbeat: an expired deadline keeps the pipe alive and merely gives the
//! loop a chance to observe cancellation. The first direction to finish ends
//! the pipe; the parent cancels the other direction, lets both halves drop
//! (closing the sockets) and only then terminates the backend.

use crate::backend::Backend;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

/// Read deadline per direction; expiry is a heartbeat, not a failure
pub const READ_HEARTBEAT: Duration = Duration::from_secs(10);

/// Relay buffer size per direction
pub(crate) const BUFFER_SIZE: usize = 64 * 1024;

/// Optional in-place mutator applied to client-to-backend chunks only
pub type Director = Arc<dyn Fn(&mut Vec<u8>) + Send + Sync>;

/// Relay bytes between a client stream and a backend connection until either
/// side ends or cancellation fires, then terminate the backend.
///
/// The backend is terminated exactly once, after both halves have dropped.
pub async fn run<C, B>(
    client: C,
    backend_conn: B,
    backend: Box<dyn Backend>,
    director: Option<Director>,
    heartbeat: Duration,
    cancel: watch::Receiver<bool>,
    conn_id: &str,
) where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend_conn);

    let mut upstream = tokio::spawn(relay(
        client_read,
        backend_write,
        director,
        heartbeat,
        cancel.clone(),
        "client->backend",
    ));
    let mut downstream = tokio::spawn(relay(
        backend_read,
        client_write,
        None,
        heartbeat,
        cancel,
        "backend->client",
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

    // Both halves are dropped at this point, so both sockets are closed.
    debug!(conn = conn_id, backend = backend.id(), "Closing pipe");
    backend.terminate().await;
}

/// Copy from `src` to `dst` until EOF, a non-timeout error, or cancellation
async fn relay<R, W>(
    mut src: R,
    mut dst: W,
    director: Option<Director>,
    heartbeat: Duration,
    mut cancel: watch::Receiver<bool>,
    direction: &'static str,
) where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow_and_update() {
                    debug!(direction, "Pipe cancelled");
                    return;
                }
            }
            result = tokio::time::timeout(heartbeat, src.read(&mut buf)) => {
                let n = match result {
                    // Deadline expired without bytes: still alive, keep going.
                    Err(_) => continue,
                    Ok(Ok(0)) => {
                        debug!(direction, "Stream closed");
                        return;
                    }
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        debug!(direction, error = %crate::error::Error::PipeIo(e), "Read failed");
                        return;
                    }
                };

                let write_result = if let Some(filter) = &director {
                    let mut chunk = buf[..n].to_vec();
                    filter(&mut chunk);
                    dst.write_all(&chunk).await
                } else {
                    dst.write_all(&buf[..n]).await
                };

                if let Err(e) = write_result {
                    debug!(direction, error = %crate::error::Error::PipeIo(e), "Write failed");
                    return;
                }
            }
        }
    }
}
