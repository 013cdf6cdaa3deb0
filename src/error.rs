//! Error kinds for the proxy and its backend collaborators

use std::net::SocketAddr;

/// Errors raised by the proxy, its servers and its backend strategies.
///
/// Startup kinds (`ConfigInvalid`, `ListenerBind`, `TlsLoad`) are fatal to the
/// binary. Per-connection kinds are recovered locally by closing the client
/// and continuing to serve.
#[derive(Debug)]
pub enum Error {
    /// The configuration file is missing, unparsable, or inconsistent
    ConfigInvalid(String),
    /// A listener could not bind its address
    ListenerBind {
        addr: String,
        source: std::io::Error,
    },
    /// Certificate or key material could not be loaded
    TlsLoad(String),
    /// The OS refused to hand out an ephemeral port
    PortExhausted(std::io::Error),
    /// The container engine or cluster API is unreachable or rejected a call
    EngineUnavailable(String),
    /// An image pull was attempted and failed
    ImagePull { image: String, reason: String },
    /// The factory could not produce a backend
    BackendUnavailable(String),
    /// Every candidate pod is already leased
    NoBackendAvailable,
    /// A pod lease update lost the optimistic-concurrency race
    PodClaimConflict { pod: String },
    /// The backend disappeared while the handle was live
    BackendGone { id: String },
    /// The backend exists but its dial address cannot be resolved
    TargetUnresolvable(String),
    /// The backend did not accept a connection within the dial budget
    DialTimeout { target: SocketAddr },
    /// A relay direction failed on read or write
    PipeIo(std::io::Error),
    /// Active pipes did not drain within the shutdown budget
    ShutdownTimeout { open: usize },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ConfigInvalid(msg) => write!(f, "invalid configuration: {}", msg),
            Error::ListenerBind { addr, source } => {
                write!(f, "failed to bind listener on {}: {}", addr, source)
            }
            Error::TlsLoad(msg) => write!(f, "failed to load TLS material: {}", msg),
            Error::PortExhausted(e) => write!(f, "no free port on host: {}", e),
            Error::EngineUnavailable(msg) => write!(f, "backend engine unavailable: {}", msg),
            Error::ImagePull { image, reason } => {
                write!(f, "failed to pull image '{}': {}", image, reason)
            }
            Error::BackendUnavailable(msg) => write!(f, "backend unavailable: {}", msg),
            Error::NoBackendAvailable => write!(f, "no backend available"),
            Error::PodClaimConflict { pod } => {
                write!(f, "pod '{}' was claimed by another proxy", pod)
            }
            Error::BackendGone { id } => write!(f, "backend '{}' is gone", id),
            Error::TargetUnresolvable(msg) => {
                write!(f, "cannot resolve backend target: {}", msg)
            }
            Error::DialTimeout { target } => {
                write!(f, "timeout establishing connection to backend {}", target)
            }
            Error::PipeIo(e) => write!(f, "pipe I/O error: {}", e),
            Error::ShutdownTimeout { open } => {
                write!(f, "shutdown drain elapsed with {} pipes still open", open)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ListenerBind { source, .. } => Some(source),
            Error::PortExhausted(e) | Error::PipeIo(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = Error::ConfigInvalid("backend type missing".into());
        assert_eq!(e.to_string(), "invalid configuration: backend type missing");

        let e = Error::NoBackendAvailable;
        assert_eq!(e.to_string(), "no backend available");

        let e = Error::DialTimeout {
            target: "127.0.0.1:5900".parse().unwrap(),
        };
        assert!(e.to_string().contains("127.0.0.1:5900"));
    }

    #[test]
    fn test_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let e = Error::ListenerBind {
            addr: "0.0.0.0:5900".into(),
            source: io,
        };
        assert!(std::error::Error::source(&e).is_some());
        assert!(std::error::Error::source(&Error::NoBackendAvailable).is_none());
    }
}
