//! Retry policy for re-establishing a remote connection

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long to wait between connection attempts, and how many to make
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Wait between two attempts
    pub interval: Duration,
    /// Maximum number of retries after the first attempt (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl ReconnectConfig {
    /// Retry forever at a fixed interval
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(5000))
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached after {attempts} attempts")]
    MaxAttemptsReached { attempts: usize },

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Tracks one run of connection attempts
pub struct ReconnectManager {
    config: ReconnectConfig,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Wait before the next attempt.
    ///
    /// Fails immediately once the attempt budget is spent, and aborts the
    /// wait as soon as `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached {
                    attempts: self.attempt,
                });
            }
        }

        debug!(
            "Waiting {}ms before reconnection attempt {}",
            self.config.interval.as_millis(),
            self.attempt
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
            _ = sleep(self.config.interval) => Ok(()),
        }
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
