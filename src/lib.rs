//! muxd - a session-oriented TCP multiplexer
//!
//! This library fronts a pool of on-demand, single-tenant backends:
//! - Accepts TCP, TLS or WebSocket connections on a front listener
//! - Provisions a dedicated backend per connection via a pluggable factory
//!   (a Docker container, or an exclusively leased Kubernetes pod)
//! - Relays bytes in both directions until either side terminates
//! - Tears the backend down with the connection
//! - Exposes accepting-state and open pipe count on a health endpoint

pub mod backend;
pub mod config;
pub mod docker;
pub mod error;
pub mod health;
pub mod kubernetes;
pub mod pipe;
pub mod server;
pub mod tls;
pub mod ws;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
