//! TCP Proxy Server Implementation
//!
//! Listens on a local port and starts a [`ProxySession`] for every client.
//! The server never touches a session after starting it; each one owns its
//! own remote connection.

use crate::config::{ConfigError, ProxyServerConfig};
use crate::session::{ProxySession, SessionStats};
use spinnaker_proxy_connection::{Remote, TcpConnector};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ProxyServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Failed to accept connections: {0}")]
    AcceptError(std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Sequential session ID generator for logging
#[derive(Clone)]
pub struct SessionIdGenerator {
    next_session_id: Arc<AtomicU32>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_session_id: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn generate(&self) -> u32 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept errors that only affect the one connection being accepted
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

pub struct ProxyServer {
    config: ProxyServerConfig,
    listener: TcpListener,
    session_ids: SessionIdGenerator,
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Validate the configuration and bind the listening socket
    pub async fn bind(config: ProxyServerConfig) -> Result<Self, ProxyServerError> {
        config.validate()?;
        let listener = Self::bind_with_retry(config.bind_addr).await?;

        Ok(Self {
            config,
            listener,
            session_ids: SessionIdGenerator::new(),
            shutdown: CancellationToken::new(),
        })
    }

    async fn bind_with_retry(bind_addr: SocketAddr) -> Result<TcpListener, ProxyServerError> {
        // Retry bind logic to handle TIME_WAIT state gracefully (up to 3 attempts with 1 second delays)
        for attempt in 1..=3 {
            match TcpListener::bind(bind_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!("Successfully bound to {} on attempt {}/3", bind_addr, attempt);
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Port {} is in use (attempt {}/3, may be in TIME_WAIT state), retrying in 1 second...",
                        bind_addr.port(),
                        attempt
                    );
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(ProxyServerError::BindError {
                        address: bind_addr.ip().to_string(),
                        port: bind_addr.port(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(ProxyServerError::BindError {
            address: bind_addr.ip().to_string(),
            port: bind_addr.port(),
            reason: "Address in use after 3 retry attempts".to_string(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the accept loop and every session when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept clients until shutdown (`Ok`) or a listener failure (`Err`).
    ///
    /// Either way all sessions are stopped before this returns.
    pub async fn run(self) -> Result<(), ProxyServerError> {
        let addr = self.listener.local_addr()?;
        info!(
            "TCP proxy listening on {}, forwarding to {}",
            addr,
            self.config.remote_target()
        );

        let mut sessions: JoinSet<SessionStats> = JoinSet::new();

        let result = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutting down TCP proxy on {}", addr);
                    break Ok(());
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        warn!("Session task failed: {}", e);
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.start_session(&mut sessions, stream, peer_addr),
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("Failed to accept TCP connection: {}", e);
                    }
                    Err(e) => {
                        error!("Listener on {} failed: {}", addr, e);
                        break Err(ProxyServerError::AcceptError(e));
                    }
                },
            }
        };

        // Sessions hold child tokens, so this stops them all
        self.shutdown.cancel();
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                warn!("Session task failed: {}", e);
            }
        }
        debug!("All sessions on {} finished", addr);

        result
    }

    fn start_session(
        &self,
        sessions: &mut JoinSet<SessionStats>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) {
        let session_id = self.session_ids.generate();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(session_id, "Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let session_shutdown = self.shutdown.child_token();
        let remote = Remote::new(
            TcpConnector::new(self.config.remote_host.clone(), self.config.remote_port),
            self.config.remote.clone(),
            session_shutdown.child_token(),
        );
        let session = ProxySession::start(
            session_id,
            stream,
            peer_addr,
            remote,
            self.config.buffer_size,
            &session_shutdown,
        );

        sessions.spawn(async move {
            let stats = session.wait().await;
            info!(
                session_id,
                bytes_to_remote = stats.bytes_to_remote,
                bytes_to_client = stats.bytes_to_client,
                "Session with {} closed",
                peer_addr
            );
            stats
        });
    }
}
