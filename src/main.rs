//! spinnaker-proxy - TCP proxy that survives restarts of its target
//!
//! Forwards every client on a local port to one remote host and port,
//! reconnecting to the remote whenever it drops.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{build_server_config, load_config_file, ConfigFile, Overrides};
use spinnaker_proxy_server::{parse_port, ProxyServer, ProxyServerConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Invalid command line or configuration
const EX_USAGE: u8 = 64;
/// The listener failed
const EX_SOFTWARE: u8 = 70;

/// Reconnecting TCP proxy
#[derive(Parser, Debug)]
#[command(name = "spinnaker-proxy")]
#[command(about = "TCP proxy that reconnects to its target if the target goes down")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Listens on LOCAL_PORT and forwards each client connection to
REMOTE_HOST:REMOTE_PORT. If the remote goes away, the proxy keeps the
client connected and reconnects to the remote until it is back.

EXAMPLES:
  # Forward local port 9000 to a board on port 17893
  spinnaker-proxy 9000 spinn-4.cs.man.ac.uk 17893

  # Give up on the remote after 12 retries one second apart
  spinnaker-proxy 9000 10.11.192.1 17893 \
    --retry-interval-ms 1000 --max-connect-attempts 12

  # Load tuning from a file
  spinnaker-proxy 9000 10.11.192.1 17893 --config proxy.yaml

ENVIRONMENT VARIABLES:
  SPINNAKER_PROXY_BIND_ADDRESS          Local interface to listen on
  SPINNAKER_PROXY_RETRY_INTERVAL_MS     Wait between connection attempts
  SPINNAKER_PROXY_WRITE_POLL_MS         Wait between checks for a connection
  SPINNAKER_PROXY_MAX_CONNECT_ATTEMPTS  Retries before giving up (0 = never)
  SPINNAKER_PROXY_BUFFER_SIZE           Forwarding buffer size in bytes
"#)]
struct Args {
    /// Local port to listen on (0-65535)
    #[arg(value_parser = parse_port)]
    local_port: u16,

    /// Remote host to forward to
    remote_host: String,

    /// Remote port to forward to (0-65535)
    #[arg(value_parser = parse_port)]
    remote_port: u16,

    /// Local interface to listen on [default: 0.0.0.0]
    #[arg(long, env = "SPINNAKER_PROXY_BIND_ADDRESS")]
    bind_address: Option<IpAddr>,

    /// Milliseconds between attempts to reach the remote [default: 5000]
    #[arg(long, env = "SPINNAKER_PROXY_RETRY_INTERVAL_MS")]
    retry_interval_ms: Option<u64>,

    /// Milliseconds between checks for a connection while a write waits [default: 1000]
    #[arg(long, env = "SPINNAKER_PROXY_WRITE_POLL_MS")]
    write_poll_ms: Option<u64>,

    /// Retries before giving up on the remote (0 = retry forever) [default: 0]
    #[arg(long, env = "SPINNAKER_PROXY_MAX_CONNECT_ATTEMPTS")]
    max_connect_attempts: Option<usize>,

    /// Forwarding buffer size in bytes [default: 4096]
    #[arg(long, env = "SPINNAKER_PROXY_BUFFER_SIZE")]
    buffer_size: Option<usize>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_config(args: &Args) -> Result<ProxyServerConfig> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let overrides = Overrides {
        bind_address: args.bind_address,
        buffer_size: args.buffer_size,
        retry_interval_ms: args.retry_interval_ms,
        write_poll_ms: args.write_poll_ms,
        max_connect_attempts: args.max_connect_attempts,
    };

    build_server_config(
        args.local_port,
        &args.remote_host,
        args.remote_port,
        overrides,
        file,
    )
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to watch SIGTERM")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to watch SIGINT")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C)"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to watch Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = setup_logging(&args.log_level) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(EX_USAGE);
    }

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EX_USAGE);
        }
    };

    info!(
        "Proxying {} -> {}",
        config.bind_addr,
        config.remote_target()
    );

    let server = match ProxyServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EX_SOFTWARE);
        }
    };

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("{:#}", e);
            return;
        }
        info!("Shutting down...");
        shutdown.cancel();
    });

    match server.run().await {
        Ok(()) => {
            info!("Proxy stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Proxy failed: {}", e);
            ExitCode::from(EX_SOFTWARE)
        }
    }
}
