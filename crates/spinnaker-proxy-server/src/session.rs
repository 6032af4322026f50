//! One proxied client connection
//!
//! A session pairs an accepted client with its own [`Remote`] and pumps bytes
//! in both directions on two independent tasks. Whichever pump stops first
//! closes the client and the remote, which in turn stops the other pump.

use spinnaker_proxy_connection::{Connector, Remote};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bytes moved by a finished session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub bytes_to_remote: u64,
    pub bytes_to_client: u64,
}

/// State both pumps share
struct Shared<C: Connector> {
    session_id: u32,
    peer: SocketAddr,
    remote: Remote<C>,
    client_left: AtomicBool,
    client_gone: CancellationToken,
}

impl<C: Connector> Shared<C> {
    /// Close the client exactly once, waking whichever pump is still using it
    fn force_close_client(&self) {
        if self.client_left.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = self.session_id, "Client {} left", self.peer);
        self.client_gone.cancel();
    }

    fn finish(&self) {
        self.force_close_client();
        self.remote.close();
    }
}

pub struct ProxySession {
    session_id: u32,
    peer: SocketAddr,
    client_to_remote: JoinHandle<u64>,
    remote_to_client: JoinHandle<u64>,
}

impl ProxySession {
    /// Start forwarding between `client` and `remote`.
    ///
    /// Cancelling `shutdown` ends the session as if the client had left.
    pub fn start<S, C>(
        session_id: u32,
        client: S,
        peer: SocketAddr,
        remote: Remote<C>,
        buffer_size: usize,
        shutdown: &CancellationToken,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        C: Connector,
    {
        info!(session_id, "New connection from {}", peer);

        let (client_read, client_write) = tokio::io::split(client);
        let shared = Arc::new(Shared {
            session_id,
            peer,
            remote,
            client_left: AtomicBool::new(false),
            client_gone: shutdown.child_token(),
        });

        let buffer_size = buffer_size.max(1);
        let client_to_remote = tokio::spawn(client_to_remote(
            shared.clone(),
            client_read,
            buffer_size,
        ));
        let remote_to_client = tokio::spawn(remote_to_client(shared, client_write, buffer_size));

        Self {
            session_id,
            peer,
            client_to_remote,
            remote_to_client,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Wait for both pumps to stop
    pub async fn wait(self) -> SessionStats {
        let (to_remote, to_client) = tokio::join!(self.client_to_remote, self.remote_to_client);

        let bytes_to_remote = to_remote.unwrap_or_else(|e| {
            warn!(session_id = self.session_id, "Client pump failed: {}", e);
            0
        });
        let bytes_to_client = to_client.unwrap_or_else(|e| {
            warn!(session_id = self.session_id, "Remote pump failed: {}", e);
            0
        });

        SessionStats {
            bytes_to_remote,
            bytes_to_client,
        }
    }
}

/// Read the client and send to the remote. Remote failures are retried
/// inside [`Remote`]; a client failure ends the session.
///
/// While a chunk waits for the remote, the client is still read into a
/// second buffer, so a client that leaves mid-outage ends the session.
async fn client_to_remote<R, C>(shared: Arc<Shared<C>>, mut client: R, buffer_size: usize) -> u64
where
    R: AsyncRead + Unpin,
    C: Connector,
{
    let session_id = shared.session_id;
    let mut buffer = vec![0u8; buffer_size];
    let mut lookahead = vec![0u8; buffer_size];
    let mut forwarded = 0u64;

    let mut pending = 0;
    let connected = tokio::select! {
        biased;
        _ = shared.client_gone.cancelled() => false,
        result = shared.remote.connect() => match result {
            Ok(()) => true,
            Err(e) => {
                debug!(session_id, "Remote unavailable: {}", e);
                false
            }
        },
        result = client.read(&mut buffer) => match result {
            Ok(0) => false,
            Ok(n) => {
                pending = n;
                true
            }
            Err(e) => {
                debug!(session_id, "Error reading from client: {}", e);
                false
            }
        },
    };

    if connected {
        'session: loop {
            if pending > 0 {
                let queued = {
                    let mut queued = 0;
                    let write = shared.remote.write(&buffer[..pending]);
                    tokio::pin!(write);

                    loop {
                        tokio::select! {
                            biased;
                            _ = shared.client_gone.cancelled() => break 'session,
                            result = &mut write => match result {
                                Ok(()) => break,
                                Err(e) => {
                                    debug!(session_id, "Stopped writing to remote: {}", e);
                                    break 'session;
                                }
                            },
                            result = client.read(&mut lookahead[queued..]), if queued < buffer_size => {
                                match result {
                                    Ok(0) => {
                                        debug!(session_id, "Client left while the remote was busy");
                                        break 'session;
                                    }
                                    Ok(n) => queued += n,
                                    Err(e) => {
                                        debug!(session_id, "Error reading from client: {}", e);
                                        break 'session;
                                    }
                                }
                            }
                        }
                    }
                    queued
                };

                debug!(session_id, "Forwarded {} bytes to remote", pending);
                forwarded += pending as u64;

                if queued > 0 {
                    std::mem::swap(&mut buffer, &mut lookahead);
                    pending = queued;
                    continue;
                }
            }

            pending = tokio::select! {
                biased;
                _ = shared.client_gone.cancelled() => break,
                result = client.read(&mut buffer) => match result {
                    Ok(0) => {
                        debug!(session_id, "Client closed the connection");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(session_id, "Error reading from client: {}", e);
                        break;
                    }
                },
            };
        }
    }

    shared.finish();
    forwarded
}

/// Read the remote and send to the client. Stops when the remote is closed
/// or the client cannot be written.
async fn remote_to_client<W, C>(shared: Arc<Shared<C>>, mut client: W, buffer_size: usize) -> u64
where
    W: AsyncWrite + Unpin,
    C: Connector,
{
    let session_id = shared.session_id;
    let mut forwarded = 0u64;

    let connected = tokio::select! {
        biased;
        _ = shared.client_gone.cancelled() => false,
        result = shared.remote.connect() => match result {
            Ok(()) => true,
            Err(e) => {
                debug!(session_id, "Remote unavailable: {}", e);
                false
            }
        },
    };

    if connected {
        let mut buffer = vec![0u8; buffer_size];
        loop {
            let n = tokio::select! {
                biased;
                _ = shared.client_gone.cancelled() => break,
                result = shared.remote.read(&mut buffer) => match result {
                    Ok(Some(n)) => n,
                    Ok(None) => {
                        debug!(session_id, "Remote closed");
                        break;
                    }
                    Err(e) => {
                        debug!(session_id, "Stopped reading from remote: {}", e);
                        break;
                    }
                },
            };

            let written = tokio::select! {
                biased;
                _ = shared.client_gone.cancelled() => break,
                result = async {
                    client.write_all(&buffer[..n]).await?;
                    client.flush().await?;
                    Ok::<(), std::io::Error>(())
                } => result,
            };

            if let Err(e) = written {
                debug!(session_id, "Failed to write to client: {}", e);
                break;
            }
            debug!(session_id, "Forwarded {} bytes to client", n);
            forwarded += n as u64;
        }
    }

    shared.finish();
    if let Err(e) = client.shutdown().await {
        debug!(session_id, "Error shutting down client: {}", e);
    }
    forwarded
}
