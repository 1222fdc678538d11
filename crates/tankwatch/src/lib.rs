//! Telemetry session and change notification engine.
//!
//! `tankwatch` follows one Lightstreamer item (the ISS urine tank level),
//! keeps the latest reading, and tells a set of chat subscribers when the
//! level moves by at least a configured threshold.
//!
//! # Architecture
//!
//! ```text
//! FeedTransport ──FeedEvent──► TelemetrySession ──► ReadingStore
//!                                    │
//!                                    ▼ ChangeDetector
//!                         broadcast<ChangeEvent>
//!                                    │
//!                                    ▼
//!                       NotificationDispatcher ──► MessageSender
//!                                    │
//!                          SubscriberRegistry
//! ```
//!
//! [`Monitor`] builds and owns all of it. Hosts talk to the monitor for
//! status, subscriptions and lifecycle; they supply the transport and the
//! message sender.

pub mod backoff;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod lightstreamer;
pub mod monitor;
pub mod reading;
pub mod registry;
pub mod session;
pub mod transport;

pub use backoff::{Backoff, BackoffPolicy};
pub use detector::{ChangeDetector, ChangeEvent, Direction};
pub use dispatch::{render_notification, DispatchReport, MessageSender, NotificationDispatcher};
pub use error::{MonitorError, SendError, TransportError};
pub use lightstreamer::{LightstreamerConfig, LightstreamerTransport};
pub use monitor::{ConnectionTest, Monitor, MonitorConfig, StatusSnapshot};
pub use reading::{Reading, ReadingStore, StoreOutcome};
pub use registry::{ChatId, Subscriber, SubscriberRegistry};
pub use session::{ConnectionState, SessionHealth, SessionOptions, TelemetrySession};
pub use transport::{FeedEvent, FeedTransport, RawUpdate};
