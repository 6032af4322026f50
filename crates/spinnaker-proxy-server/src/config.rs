//! Proxy server configuration and validation

use spinnaker_proxy_connection::RemoteConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

/// Largest chunk read from a client in one go
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid port '{value}': expected an integer between 0 and 65535")]
    InvalidPort { value: String },

    #[error("Remote host cannot be empty")]
    EmptyRemoteHost,

    #[error("Buffer size must be greater than zero")]
    InvalidBufferSize,
}

/// Parse a port number, rejecting anything outside 0-65535
pub fn parse_port(value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort {
            value: value.to_string(),
        })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyServerConfig {
    /// Local address to accept clients on
    pub bind_addr: SocketAddr,
    /// Host every session connects to
    pub remote_host: String,
    pub remote_port: u16,
    /// Retry timing of each session's remote connection
    pub remote: RemoteConfig,
    /// Size of the per-direction forwarding buffer
    pub buffer_size: usize,
}

impl ProxyServerConfig {
    /// Listen on `local_port` on all interfaces and forward to `remote_host:remote_port`
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local_port),
            remote_host: remote_host.into(),
            remote_port,
            remote: RemoteConfig::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_addr.set_ip(ip);
        self
    }

    pub fn with_remote_config(mut self, remote: RemoteConfig) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn remote_target(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_host.trim().is_empty() {
            return Err(ConfigError::EmptyRemoteHost);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize);
        }
        Ok(())
    }
}
