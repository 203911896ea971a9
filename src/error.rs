//! Error taxonomy for the history service
//!
//! Startup errors (`InvalidConfiguration`, `JoinFailed`) are fatal. Late
//! events never show up here: the engine drops them and counts them in
//! `EngineStats`. Sink failures are surfaced with the results that could not
//! be published so the caller decides whether to retry, buffer or drop.

use crate::pipeline::{SinkError, SourceError};
use std::io::Error as IoError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Non-positive window/hop length, conflicting discovery modes, bad values
    InvalidConfiguration(String),
    /// Cluster membership could not be established after bounded retries
    JoinFailed(String),
    /// Engine received a reading before the node joined a cluster
    NotReady,
    /// Downstream publish failed; carries the unpublished results
    SinkUnavailable(SinkError),
    /// Upstream source failed
    Source(SourceError),
    /// I/O error
    Io(IoError),
}

impl Error {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfiguration(msg.into())
    }

    /// Fatal errors abort startup and make the process exit non-zero
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_) | Error::JoinFailed(_) | Error::SinkUnavailable(_)
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::JoinFailed(msg) => write!(f, "Failed to join cluster: {}", msg),
            Error::NotReady => write!(f, "Engine not ready: cluster membership not established"),
            Error::SinkUnavailable(e) => write!(f, "Sink unavailable: {}", e),
            Error::Source(e) => write!(f, "Source error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::SinkUnavailable(e) => Some(e),
            Error::Source(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<SinkError> for Error {
    fn from(e: SinkError) -> Self {
        Error::SinkUnavailable(e)
    }
}

impl From<SourceError> for Error {
    fn from(e: SourceError) -> Self {
        Error::Source(e)
    }
}
