//! Proxy configuration: YAML file merged with command-line settings
//!
//! Command-line flags (and their environment variables) win over the file,
//! and the file wins over built-in defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spinnaker_proxy_connection::{ReconnectConfig, RemoteConfig};
use spinnaker_proxy_server::ProxyServerConfig;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration file format
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Local interface to listen on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<IpAddr>,

    /// Forwarding buffer size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,

    #[serde(default)]
    pub remote: RemoteSection,
}

/// Remote connection tuning
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_poll_ms: Option<u64>,

    /// Retries before giving up on the remote (0 or absent = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connect_attempts: Option<usize>,
}

/// Settings given on the command line; `None` means "not given"
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Overrides {
    pub bind_address: Option<IpAddr>,
    pub buffer_size: Option<usize>,
    pub retry_interval_ms: Option<u64>,
    pub write_poll_ms: Option<u64>,
    pub max_connect_attempts: Option<usize>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge command-line settings over the file and build the server configuration
pub fn build_server_config(
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
    overrides: Overrides,
    file: ConfigFile,
) -> Result<ProxyServerConfig> {
    let retry_interval_ms = overrides
        .retry_interval_ms
        .or(file.remote.retry_interval_ms)
        .unwrap_or(5000);
    let write_poll_ms = overrides
        .write_poll_ms
        .or(file.remote.write_poll_ms)
        .unwrap_or(1000);
    let max_connect_attempts = overrides
        .max_connect_attempts
        .or(file.remote.max_connect_attempts)
        .filter(|attempts| *attempts > 0);

    if retry_interval_ms == 0 {
        anyhow::bail!("Retry interval must be at least 1 ms");
    }
    if write_poll_ms == 0 {
        anyhow::bail!("Write poll interval must be at least 1 ms");
    }

    let remote = RemoteConfig {
        reconnect: ReconnectConfig::fixed(Duration::from_millis(retry_interval_ms))
            .with_max_attempts(max_connect_attempts),
        write_poll_interval: Duration::from_millis(write_poll_ms),
    };

    let mut config = ProxyServerConfig::new(local_port, remote_host, remote_port)
        .with_remote_config(remote);
    if let Some(ip) = overrides.bind_address.or(file.bind_address) {
        config = config.with_bind_ip(ip);
    }
    if let Some(buffer_size) = overrides.buffer_size.or(file.buffer_size) {
        config = config.with_buffer_size(buffer_size);
    }

    config.validate().context("Invalid proxy configuration")?;

    Ok(config)
}
