//! TCP Proxy Server
//!
//! Listens on a local port and gives every accepted client its own
//! reconnecting connection to one fixed remote endpoint.

mod config;
mod server;
mod session;

pub use config::{parse_port, ConfigError, ProxyServerConfig, DEFAULT_BUFFER_SIZE};
pub use server::{ProxyServer, ProxyServerError, SessionIdGenerator};
pub use session::{ProxySession, SessionStats};
