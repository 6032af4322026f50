//! A persistent connection to a fixed remote endpoint
//!
//! [`Remote`] hides transient connection loss from its users: a failed read
//! or write tears the connection down, dials again and retries. The only
//! outcomes callers ever see are forward progress, permanent closure, or
//! cancellation.

use crate::connector::Connector;
use crate::reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors surfaced by [`Remote`]. Transport errors never are.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Interrupted while waiting on the remote")]
    Interrupted,

    #[error("Remote connection is permanently closed")]
    Closed,

    #[error("Remote {target} unreachable after {attempts} attempts")]
    Unreachable { target: String, attempts: usize },
}

/// Timing of a [`Remote`]
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    /// Policy for re-dialling after a failed attempt
    pub reconnect: ReconnectConfig,
    /// How often a write checks whether a connection has appeared
    pub write_poll_interval: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            write_poll_interval: Duration::from_millis(1000),
        }
    }
}

/// One established connection. Severing it wakes every task using it.
struct Link<S> {
    generation: u64,
    reader: tokio::sync::Mutex<ReadHalf<S>>,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    severed: CancellationToken,
}

impl<S> Link<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    fn new(generation: u64, stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            generation,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            severed: CancellationToken::new(),
        }
    }
}

fn severed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed locally")
}

/// A remote connection that reconnects until it is closed.
///
/// One task may read while another writes. When both notice the same broken
/// connection only one of them replaces it; the other picks up the new one.
pub struct Remote<C: Connector> {
    connector: C,
    config: RemoteConfig,
    link: Mutex<Option<Arc<Link<C::Stream>>>>,
    /// Held for the whole dial loop so only one task dials at a time
    dial_gate: tokio::sync::Mutex<()>,
    generations: AtomicU64,
    closed: AtomicBool,
    closing: CancellationToken,
    interrupt: CancellationToken,
}

impl<C: Connector> Remote<C> {
    /// Create a remote; nothing is dialled until [`connect`](Self::connect).
    ///
    /// Cancelling `interrupt` aborts every pending wait with
    /// [`RemoteError::Interrupted`].
    pub fn new(connector: C, config: RemoteConfig, interrupt: CancellationToken) -> Self {
        Self {
            connector,
            config,
            link: Mutex::new(None),
            dial_gate: tokio::sync::Mutex::new(()),
            generations: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
            interrupt,
        }
    }

    pub fn target(&self) -> String {
        self.connector.target()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Link<C::Stream>>>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<Link<C::Stream>>> {
        self.slot().clone()
    }

    /// Connect, retrying until it works.
    ///
    /// Returns at once if already connected or closed. Closing the remote
    /// while this waits makes it return `Ok` without a connection.
    pub async fn connect(&self) -> Result<(), RemoteError> {
        if self.is_closed() || self.is_connected() {
            return Ok(());
        }

        let _gate = self.enter_dial_gate().await?;
        self.dial().await
    }

    async fn enter_dial_gate(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, RemoteError> {
        tokio::select! {
            biased;
            _ = self.interrupt.cancelled() => Err(RemoteError::Interrupted),
            gate = self.dial_gate.lock() => Ok(gate),
        }
    }

    /// Dial until connected. The caller holds the dial gate.
    async fn dial(&self) -> Result<(), RemoteError> {
        if self.is_closed() || self.is_connected() {
            return Ok(());
        }

        let target = self.connector.target();
        info!("Connecting to {}", target);

        let mut backoff = ReconnectManager::new(self.config.reconnect.clone());
        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.interrupt.cancelled() => return Err(RemoteError::Interrupted),
                _ = self.closing.cancelled() => return Ok(()),
                result = self.connector.connect() => result,
            };

            match attempt {
                Ok(stream) => {
                    if self.install(stream) {
                        info!("Connected to {}", target);
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        "Connection attempt {} to {} failed: {}",
                        backoff.attempt() + 1,
                        target,
                        e
                    );
                }
            }

            let waited = tokio::select! {
                biased;
                _ = self.closing.cancelled() => return Ok(()),
                result = backoff.wait(&self.interrupt) => result,
            };

            match waited {
                Ok(()) => {}
                Err(ReconnectError::Cancelled) => return Err(RemoteError::Interrupted),
                Err(ReconnectError::MaxAttemptsReached { attempts }) => {
                    warn!("Giving up on {} after {} attempts", target, attempts);
                    self.close();
                    return Err(RemoteError::Unreachable { target, attempts });
                }
            }
        }
    }

    /// Publish a freshly dialled stream, unless the remote was closed meanwhile
    fn install(&self, stream: C::Stream) -> bool {
        let mut slot = self.slot();
        if self.is_closed() {
            return false;
        }
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "Installing connection to {}", self.connector.target());
        *slot = Some(Arc::new(Link::new(generation, stream)));
        true
    }

    /// Write all of `data`, retrying in full across reconnects.
    ///
    /// Waits (polling) while there is no connection.
    pub async fn write(&self, data: &[u8]) -> Result<(), RemoteError> {
        loop {
            let link = self.wait_for_link().await?;

            let outcome = {
                let mut writer = link.writer.lock().await;
                tokio::select! {
                    biased;
                    _ = self.interrupt.cancelled() => return Err(RemoteError::Interrupted),
                    _ = link.severed.cancelled() => Err(severed_error()),
                    result = async {
                        writer.write_all(data).await?;
                        writer.flush().await?;
                        Ok::<(), io::Error>(())
                    } => result,
                }
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => warn!("Write to {} failed: {}", self.connector.target(), e),
            }

            self.recover(&link).await?;
        }
    }

    async fn wait_for_link(&self) -> Result<Arc<Link<C::Stream>>, RemoteError> {
        loop {
            if self.is_closed() {
                return Err(RemoteError::Closed);
            }
            if let Some(link) = self.current() {
                return Ok(link);
            }
            tokio::select! {
                biased;
                _ = self.interrupt.cancelled() => return Err(RemoteError::Interrupted),
                _ = self.closing.cancelled() => return Err(RemoteError::Closed),
                _ = sleep(self.config.write_poll_interval) => {}
            }
        }
    }

    /// Read into `buffer`, retrying across reconnects.
    ///
    /// Returns `Some(n)` with `n > 0` bytes read, or `None` (end of stream)
    /// when there is no connection to read from. An end of stream from the
    /// transport itself counts as a failure and triggers a reconnect.
    ///
    /// A reconnect already under way in another task is waited for rather
    /// than reported as end of stream.
    pub async fn read(&self, buffer: &mut [u8]) -> Result<Option<usize>, RemoteError> {
        if buffer.is_empty() {
            return Ok(Some(0));
        }

        loop {
            let link = match self.current() {
                Some(link) => link,
                None => {
                    if self.is_closed() || self.dial_gate.try_lock().is_ok() {
                        return Ok(None);
                    }
                    self.rejoin(self.connect().await)?;
                    continue;
                }
            };

            let outcome = {
                let mut reader = link.reader.lock().await;
                tokio::select! {
                    biased;
                    _ = self.interrupt.cancelled() => return Err(RemoteError::Interrupted),
                    _ = link.severed.cancelled() => Err(severed_error()),
                    result = reader.read(buffer) => result,
                }
            };

            match outcome {
                Ok(0) => warn!("Remote {} closed the connection", self.connector.target()),
                Ok(n) => return Ok(Some(n)),
                Err(e) => warn!("Read from {} failed: {}", self.connector.target(), e),
            }

            self.rejoin(self.recover(&link).await)?;
        }
    }

    /// Reads only report interruption; every other failure leaves the remote
    /// closed and shows up as end of stream on the next pass.
    fn rejoin(&self, result: Result<(), RemoteError>) -> Result<(), RemoteError> {
        match result {
            Err(RemoteError::Interrupted) => Err(RemoteError::Interrupted),
            _ => Ok(()),
        }
    }

    /// Drop a connection that failed and dial a new one.
    ///
    /// The failed connection is only dropped under the dial gate, so a reader
    /// never sees the slot empty without a reconnect in progress.
    async fn recover(&self, failed: &Link<C::Stream>) -> Result<(), RemoteError> {
        if self.is_closed() {
            return Ok(());
        }
        let _gate = self.enter_dial_gate().await?;
        self.close_generation(failed.generation);
        self.dial().await
    }

    fn close_generation(&self, generation: u64) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|link| link.generation == generation) {
            if let Some(link) = slot.take() {
                debug!(generation, "Dropping failed connection");
                link.severed.cancel();
            }
        }
    }

    /// Close the current connection, if any. The remote may reconnect later.
    pub fn close_connections(&self) {
        let link = self.slot().take();
        if let Some(link) = link {
            debug!(
                generation = link.generation,
                "Closing connection to {}",
                self.connector.target()
            );
            link.severed.cancel();
        }
    }

    /// Close for good; no reconnect happens after this. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing remote {}", self.connector.target());
            self.closing.cancel();
        }
        self.close_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;
    use tokio::time::Instant;

    /// Hands out pre-built streams in order, refusing once they run out
    #[derive(Clone, Default)]
    struct ScriptedConnector {
        script: Arc<Mutex<VecDeque<io::Result<DuplexStream>>>>,
        attempts: Arc<AtomicUsize>,
    }

    impl ScriptedConnector {
        fn push_stream(&self) -> DuplexStream {
            let (ours, theirs) = tokio::io::duplex(1024);
            self.script.lock().unwrap().push_back(Ok(ours));
            theirs
        }

        fn push_refusal(&self) {
            self.script
                .lock()
                .unwrap()
                .push_back(Err(io::ErrorKind::ConnectionRefused.into()));
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Stream = DuplexStream;

        async fn connect(&self) -> io::Result<DuplexStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(io::ErrorKind::ConnectionRefused.into()))
        }

        fn target(&self) -> String {
            "scripted:1".to_string()
        }
    }

    fn remote(connector: &ScriptedConnector) -> Arc<Remote<ScriptedConnector>> {
        Arc::new(Remote::new(
            connector.clone(),
            RemoteConfig::default(),
            CancellationToken::new(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_every_five_seconds() {
        let connector = ScriptedConnector::default();
        connector.push_refusal();
        connector.push_refusal();
        let _peer = connector.push_stream();
        let remote = remote(&connector);

        let start = Instant::now();
        remote.connect().await.unwrap();

        assert!(remote.is_connected());
        assert_eq!(connector.attempts(), 3);
        assert!(start.elapsed() >= Duration::from_millis(10000));
        assert!(start.elapsed() < Duration::from_millis(10100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let connector = ScriptedConnector::default();
        let _peer = connector.push_stream();
        let remote = remote(&connector);

        remote.connect().await.unwrap();
        remote.connect().await.unwrap();

        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_and_read_round_trip() {
        let connector = ScriptedConnector::default();
        let mut peer = connector.push_stream();
        let remote = remote(&connector);
        remote.connect().await.unwrap();

        remote.write(b"PING").await.unwrap();
        let mut received = [0u8; 4];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"PING");

        peer.write_all(b"PONG").await.unwrap();
        let mut buffer = [0u8; 16];
        let n = remote.read(&mut buffer).await.unwrap().unwrap();
        assert_eq!(&buffer[..n], b"PONG");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_retried_in_full() {
        let connector = ScriptedConnector::default();
        let first = connector.push_stream();
        let mut second = connector.push_stream();
        let remote = remote(&connector);
        remote.connect().await.unwrap();

        drop(first);
        remote.write(b"hello").await.unwrap();

        let mut received = [0u8; 5];
        second.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"hello");
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_eof_triggers_reconnect() {
        let connector = ScriptedConnector::default();
        let first = connector.push_stream();
        connector.push_refusal();
        let mut second = connector.push_stream();
        let remote = remote(&connector);
        remote.connect().await.unwrap();

        drop(first);
        second.write_all(b"after restart").await.unwrap();

        let start = Instant::now();
        let mut buffer = [0u8; 64];
        let n = remote.read(&mut buffer).await.unwrap().unwrap();

        assert_eq!(&buffer[..n], b"after restart");
        assert_eq!(connector.attempts(), 3);
        assert!(start.elapsed() >= Duration::from_millis(5000));
        assert!(start.elapsed() < Duration::from_millis(5100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_replace_connection_once() {
        let connector = ScriptedConnector::default();
        let first = connector.push_stream();
        let mut second = connector.push_stream();
        let _third = connector.push_stream();
        let remote = remote(&connector);
        remote.connect().await.unwrap();

        drop(first);
        second.write_all(b"y").await.unwrap();

        let reader = {
            let remote = remote.clone();
            tokio::spawn(async move {
                let mut buffer = [0u8; 8];
                remote.read(&mut buffer).await.map(|n| n.map(|n| buffer[..n].to_vec()))
            })
        };
        // Let the reader hit the dead connection first
        tokio::task::yield_now().await;
        remote.write(b"x").await.unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), Some(b"y".to_vec()));
        let mut received = [0u8; 1];
        second.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"x");
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_waits_for_connection() {
        let connector = ScriptedConnector::default();
        let mut peer = connector.push_stream();
        let remote = remote(&connector);

        let writer = {
            let remote = remote.clone();
            tokio::spawn(async move { remote.write(b"queued").await })
        };

        sleep(Duration::from_millis(2500)).await;
        assert!(!writer.is_finished());

        remote.connect().await.unwrap();
        writer.await.unwrap().unwrap();

        let mut received = [0u8; 6];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"queued");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_after_close_returns_eof() {
        let connector = ScriptedConnector::default();
        let _peer = connector.push_stream();
        let remote = remote(&connector);
        remote.connect().await.unwrap();

        remote.close();

        let start = Instant::now();
        let mut buffer = [0u8; 16];
        assert_eq!(remote.read(&mut buffer).await.unwrap(), None);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_without_connection_returns_eof() {
        let connector = ScriptedConnector::default();
        let mut peer = connector.push_stream();
        let remote = remote(&connector);

        let start = Instant::now();
        let mut buffer = [0u8; 16];
        assert_eq!(remote.read(&mut buffer).await.unwrap(), None);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(connector.attempts(), 0);

        // Nothing was closed: the remote still connects and reads normally
        assert!(!remote.is_closed());
        remote.connect().await.unwrap();
        peer.write_all(b"late").await.unwrap();
        let n = remote.read(&mut buffer).await.unwrap().unwrap();
        assert_eq!(&buffer[..n], b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_waits_for_reconnect_in_progress() {
        let connector = ScriptedConnector::default();
        let first = connector.push_stream();
        connector.push_refusal();
        let mut second = connector.push_stream();
        let remote = remote(&connector);
        remote.connect().await.unwrap();

        drop(first);
        let writer = {
            let remote = remote.clone();
            tokio::spawn(async move { remote.write(b"x").await })
        };

        // The writer has dropped the dead connection and is backing off
        sleep(Duration::from_millis(1000)).await;
        assert!(!remote.is_connected());
        assert_eq!(connector.attempts(), 2);

        second.write_all(b"y").await.unwrap();
        let start = Instant::now();
        let mut buffer = [0u8; 8];
        let n = remote.read(&mut buffer).await.unwrap().unwrap();

        assert_eq!(&buffer[..n], b"y");
        assert!(start.elapsed() >= Duration::from_millis(4000));
        writer.await.unwrap().unwrap();
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_aborts_pending_write() {
        let connector = ScriptedConnector::default();
        let interrupt = CancellationToken::new();
        let remote = Arc::new(Remote::new(
            connector.clone(),
            RemoteConfig::default(),
            interrupt.clone(),
        ));

        let writer = {
            let remote = remote.clone();
            tokio::spawn(async move { remote.write(b"never sent").await })
        };

        sleep(Duration::from_millis(2500)).await;
        assert!(!writer.is_finished());

        let start = Instant::now();
        interrupt.cancel();

        assert!(matches!(
            writer.await.unwrap(),
            Err(RemoteError::Interrupted)
        ));
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert_eq!(connector.attempts(), 0);
        assert!(!remote.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_after_close_fails() {
        let connector = ScriptedConnector::default();
        let remote = remote(&connector);

        remote.close();

        assert!(matches!(
            remote.write(b"late").await,
            Err(RemoteError::Closed)
        ));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_terminal() {
        let connector = ScriptedConnector::default();
        let mut peer = connector.push_stream();
        let _spare = connector.push_stream();
        let remote = remote(&connector);
        remote.connect().await.unwrap();

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let remote = remote.clone();
                tokio::spawn(async move { remote.close() })
            })
            .collect();
        for closer in closers {
            closer.await.unwrap();
        }
        remote.close();

        assert!(remote.is_closed());
        assert!(!remote.is_connected());

        // The old socket is gone and no new one gets dialled
        let mut buffer = [0u8; 1];
        assert_eq!(peer.read(&mut buffer).await.unwrap(), 0);
        remote.connect().await.unwrap();
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_pending_connect_and_read() {
        let connector = ScriptedConnector::default();
        let _peer = connector.push_stream();
        let remote = remote(&connector);
        remote.connect().await.unwrap();

        let reader = {
            let remote = remote.clone();
            tokio::spawn(async move {
                let mut buffer = [0u8; 8];
                remote.read(&mut buffer).await
            })
        };

        // Second remote with nothing to connect to
        let unreachable = remote_without_streams();
        let dialer = {
            let unreachable = unreachable.clone();
            tokio::spawn(async move { unreachable.connect().await })
        };

        sleep(Duration::from_millis(12000)).await;
        remote.close();
        unreachable.close();

        assert_eq!(reader.await.unwrap().unwrap(), None);
        dialer.await.unwrap().unwrap();
        assert!(!unreachable.is_connected());
    }

    fn remote_without_streams() -> Arc<Remote<ScriptedConnector>> {
        remote(&ScriptedConnector::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_aborts_connect() {
        let connector = ScriptedConnector::default();
        let interrupt = CancellationToken::new();
        let remote = Arc::new(Remote::new(
            connector.clone(),
            RemoteConfig::default(),
            interrupt.clone(),
        ));

        let dialer = {
            let remote = remote.clone();
            tokio::spawn(async move { remote.connect().await })
        };

        sleep(Duration::from_millis(7000)).await;
        interrupt.cancel();

        assert!(matches!(
            dialer.await.unwrap(),
            Err(RemoteError::Interrupted)
        ));
        assert_eq!(connector.attempts(), 2);
        assert!(!remote.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retries_close_the_remote() {
        let connector = ScriptedConnector::default();
        let config = RemoteConfig {
            reconnect: ReconnectConfig::default().with_max_attempts(Some(2)),
            ..RemoteConfig::default()
        };
        let remote = Remote::new(connector.clone(), config, CancellationToken::new());

        let result = remote.connect().await;

        assert!(matches!(
            result,
            Err(RemoteError::Unreachable { attempts: 3, .. })
        ));
        assert_eq!(connector.attempts(), 3);
        assert!(remote.is_closed());
    }
}
