//! Persistent outbound connections for the proxy
//!
//! A [`Remote`] keeps one logical connection to a fixed endpoint alive,
//! dialling again whenever a read or write on it fails.

pub mod connector;
pub mod reconnect;
pub mod remote;

pub use connector::{Connector, TcpConnector};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use remote::{Remote, RemoteConfig, RemoteError};
