//! Host-facing facade: builds the engine pieces and wires them together.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Serialize, Serializer};
use tankconf::TankConfig;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::BackoffPolicy;
use crate::detector::{ChangeDetector, ChangeEvent};
use crate::dispatch::{spawn_dispatch_task, MessageSender, NotificationDispatcher};
use crate::error::MonitorError;
use crate::reading::{Reading, ReadingStore};
use crate::registry::{ChatId, SubscriberRegistry};
use crate::session::{ConnectionState, SessionHealth, SessionOptions, TelemetrySession};
use crate::transport::FeedTransport;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Engine settings, already validated.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub threshold: f64,
    pub session: SessionOptions,
}

impl MonitorConfig {
    pub fn new(threshold: f64, staleness_window: Duration) -> Self {
        Self {
            threshold,
            session: SessionOptions::new(staleness_window),
        }
    }
}

impl TryFrom<&TankConfig> for MonitorConfig {
    type Error = MonitorError;

    fn try_from(config: &TankConfig) -> Result<Self, Self::Error> {
        config.validate()?;

        let threshold = config
            .detector
            .significance_threshold
            .ok_or(tankconf::ConfigError::Missing {
                key: "detector.significance_threshold",
            })?;
        let staleness = config
            .session
            .staleness_window_secs
            .ok_or(tankconf::ConfigError::Missing {
                key: "session.staleness_window_secs",
            })?;

        let session = SessionOptions::new(Duration::from_secs(staleness))
            .with_watchdog_interval(Duration::from_secs(config.session.watchdog_interval_secs))
            .with_backoff(BackoffPolicy {
                base: Duration::from_millis(config.session.backoff_base_ms),
                max: Duration::from_millis(config.session.backoff_max_ms),
                stable_after: Duration::from_secs(config.session.stable_after_secs),
            });

        Ok(Self { threshold, session })
    }
}

/// Point-in-time view for `/status` and `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    #[serde(rename = "state_secs", serialize_with = "as_secs")]
    pub state_age: Duration,
    pub latest: Option<Reading>,
    #[serde(rename = "data_age_secs", serialize_with = "as_secs_opt")]
    pub data_age: Option<Duration>,
    pub last_notified: Option<Reading>,
    pub subscribers: usize,
    pub threshold: f64,
    #[serde(rename = "staleness_window_secs", serialize_with = "as_secs")]
    pub staleness_window: Duration,
    pub disconnects: u32,
    #[serde(rename = "uptime_secs", serialize_with = "as_secs")]
    pub uptime: Duration,
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

fn as_secs_opt<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs()),
        None => s.serialize_none(),
    }
}

/// Result of a connection self-check. Built from local state only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionTest {
    pub ok: bool,
    pub detail: String,
}

/// The telemetry monitor.
///
/// Owns the session, the latest-value store, the change event channel and
/// the dispatcher task. Status methods are synchronous and never wait on the
/// feed.
pub struct Monitor {
    config: MonitorConfig,
    session: TelemetrySession,
    store: Arc<ReadingStore>,
    registry: Arc<SubscriberRegistry>,
    events: broadcast::Sender<ChangeEvent>,
    dispatcher: Arc<NotificationDispatcher>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    created_at: Instant,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        transport: Arc<dyn FeedTransport>,
        sender: Arc<dyn MessageSender>,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        let store = Arc::new(ReadingStore::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session = TelemetrySession::new(
            config.session.clone(),
            transport,
            Arc::clone(&store),
            ChangeDetector::new(config.threshold),
            events.clone(),
        );
        let dispatcher = Arc::new(NotificationDispatcher::new(Arc::clone(&registry), sender));

        Self {
            config,
            session,
            store,
            registry,
            events,
            dispatcher,
            dispatch_task: Mutex::new(None),
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
        }
    }

    /// Start the feed session and the dispatcher. Idempotent; never blocks.
    pub fn start(&self) -> Result<(), MonitorError> {
        if self.session.is_shut_down() {
            return Err(MonitorError::ShutDown);
        }

        // The dispatcher must be listening before the session can emit the
        // first reading.
        {
            let mut task = self
                .dispatch_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if task.is_none() {
                *task = Some(spawn_dispatch_task(
                    Arc::clone(&self.dispatcher),
                    self.events.subscribe(),
                    self.cancel.clone(),
                ));
            }
        }

        self.session.start()
    }

    /// Stop the feed first so no new events arrive, then the dispatcher.
    pub async fn shutdown(&self) {
        info!("Shutting down monitor");
        self.session.shutdown().await;
        self.cancel.cancel();

        let handle = self
            .dispatch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Dispatch task ended abnormally: {}", e);
            }
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        self.session.current_state()
    }

    pub fn latest_reading(&self) -> Option<Reading> {
        self.store.get()
    }

    /// Time spent in the current connection state.
    pub fn connection_age(&self) -> Duration {
        self.session.health().state_age()
    }

    /// Age of the latest reading.
    pub fn data_age(&self) -> Option<Duration> {
        self.store.age_since(Utc::now())
    }

    pub fn status(&self) -> StatusSnapshot {
        let health = self.session.health();
        StatusSnapshot {
            state: health.get_state(),
            state_age: health.state_age(),
            latest: self.store.get(),
            data_age: self.data_age(),
            last_notified: health.last_notified(),
            subscribers: self.registry.len(),
            threshold: self.config.threshold,
            staleness_window: self.config.session.staleness_window,
            disconnects: health.disconnects(),
            uptime: self.created_at.elapsed(),
        }
    }

    /// Report whether the feed is connected and has delivered a reading.
    pub fn test_connection(&self) -> ConnectionTest {
        let state = self.current_state();
        let latest = self.store.get();
        let age = self.data_age();

        match (state, latest) {
            (ConnectionState::Connected, Some(reading)) => ConnectionTest {
                ok: true,
                detail: format!(
                    "connected, latest reading {:.1}% ({}s old)",
                    reading.value,
                    age.unwrap_or_default().as_secs()
                ),
            },
            (ConnectionState::Connected, None) => ConnectionTest {
                ok: false,
                detail: "connected, no reading received yet".to_string(),
            },
            (state, Some(reading)) => ConnectionTest {
                ok: false,
                detail: format!(
                    "{}, last reading {:.1}% ({}s old)",
                    state,
                    reading.value,
                    age.unwrap_or_default().as_secs()
                ),
            },
            (state, None) => ConnectionTest {
                ok: false,
                detail: format!("{}, no reading received yet", state),
            },
        }
    }

    /// Returns `true` if the chat was not already subscribed.
    pub fn subscribe(&self, chat_id: ChatId) -> bool {
        self.registry.add(chat_id)
    }

    /// Returns `true` if the chat was subscribed.
    pub fn unsubscribe(&self, chat_id: ChatId) -> bool {
        self.registry.remove(chat_id)
    }

    /// A fresh receiver for change events.
    pub fn events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &SessionHealth {
        self.session.health()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}
