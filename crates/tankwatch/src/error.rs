//! Error types for the engine and its collaborators.

use thiserror::Error;

/// Errors surfaced by the monitor facade.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor has been shut down")]
    ShutDown,

    #[error(transparent)]
    Config(#[from] tankconf::ConfigError),
}

/// Why a feed connection ended.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("server refused session ({code}): {message}")]
    Refused { code: i64, message: String },

    #[error("subscription rejected ({code}): {message}")]
    SubscriptionRejected { code: i64, message: String },

    #[error("no data for {0:?}")]
    Timeout(std::time::Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stream closed: {0}")]
    Closed(String),
}

/// Outcome of a failed delivery, as classified by the sender.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The chat will never accept messages again (blocked, deleted, kicked).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    /// Worth trying again on the next event (rate limits, timeouts, 5xx).
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

impl SendError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Permanent(_))
    }
}
