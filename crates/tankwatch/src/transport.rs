//! Seam between the session state machine and the streaming client.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// One field update for the followed item, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawUpdate {
    /// Ordering key, strictly increasing for in-order delivery
    pub sequence: u64,
    pub value: Option<String>,
    pub timestamp: Option<String>,
    pub status: Option<String>,
}

/// What a transport reports while a connection is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The server accepted the session; updates may follow.
    Connected,
    Update(RawUpdate),
}

/// A streaming client for a single telemetry item.
///
/// `run` opens one connection and pushes events into `events` until that
/// connection ends. Returning `Ok` means the server closed the stream in an
/// orderly way; `Err` is a transport failure. Either way the session decides
/// when to call `run` again. Implementations must not retry internally.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn run(&self, events: mpsc::Sender<FeedEvent>) -> Result<(), TransportError>;

    /// Short description for logs (endpoint and item).
    fn describe(&self) -> String;
}
