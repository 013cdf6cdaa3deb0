//! Backend abstraction: ephemeral, single-tenant compute claimed per connection

use crate::error::Error;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// An ephemeral compute endpoint handling exactly one client stream.
///
/// A backend lives for exactly one pipe: the factory produces it immediately
/// before use and the pipe terminates it on teardown.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Opaque identity for log correlation
    fn id(&self) -> &str;

    /// The address the proxy should dial. May be recomputed on each call,
    /// e.g. a pod IP lookup.
    async fn target(&self) -> Result<SocketAddr, Error>;

    /// Best-effort release of the backing resource. Idempotent, never
    /// raises; failures are logged and the resource may leak.
    async fn terminate(&self);
}

/// Nullary capability producing a fresh [`Backend`] per connection
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Backend>, Error>;
}

/// Ask the OS for an ephemeral TCP port by binding and releasing it.
///
/// The port is a hint only: another process may grab it between the release
/// and the moment the real consumer binds.
pub async fn free_port() -> Result<u16, Error> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(Error::PortExhausted)?;
    let port = listener
        .local_addr()
        .map_err(Error::PortExhausted)?
        .port();
    drop(listener);
    Ok(port)
}
