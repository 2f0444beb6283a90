use std::time::Duration;

use crate::types::DestinationName;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The result deadline passed. The task itself may still run to completion.
    #[error("timed out after {0:?} waiting for task result")]
    Timeout(Duration),
    /// The task was dropped before it produced a result.
    #[error("task cancelled before completion")]
    TaskCancelled,
    #[error("credit exhausted, {outstanding} outstanding of {max}")]
    CreditExhausted { outstanding: usize, max: usize },
    #[error("destination {0} is closed")]
    DestinationClosed(DestinationName),
    #[error("selector error, {0}")]
    Selector(String),
    #[error("config error, {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    #[inline]
    pub fn msg<M: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static>(m: M) -> Self {
        Error::Anyhow(anyhow::Error::msg(m))
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Cancellation is a soft failure; callers return an empty result instead of an error.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::TaskCancelled)
    }
}
