//! Telemetry session: one feed connection, owned by one task.
//!
//! The session task is the only writer of [`ConnectionState`] and the only
//! producer of readings. It runs the transport, handles its events serially
//! in arrival order, watches for stale data, and reconnects with backoff when
//! the connection ends.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Degraded
//!       ^              |             |            |
//!       +--------------+-------------+------------+   (transport failure)
//! ```
//!
//! Status readers only touch atomics and short-lived locks on
//! [`SessionHealth`]; they never wait on the feed.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Serialize, Serializer};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::detector::{ChangeDetector, ChangeEvent};
use crate::error::MonitorError;
use crate::reading::{Reading, ReadingStore, StoreOutcome};
use crate::transport::{FeedEvent, FeedTransport, RawUpdate};

/// Feed connection state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; either not started or waiting to reconnect
    Disconnected = 0,
    /// Connection attempt in progress
    Connecting = 1,
    /// Server accepted the session and data is fresh
    Connected = 2,
    /// Connection alive but no update within the staleness window
    Degraded = 3,
}

impl ConnectionState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Degraded,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        }
    }

    /// Connected or Degraded.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for ConnectionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Lock-free view of the session for status queries.
#[derive(Debug)]
pub struct SessionHealth {
    state: AtomicU8,
    /// When the current state was entered
    since: RwLock<Instant>,
    /// Last accepted update
    last_data: RwLock<Option<Instant>>,
    /// Reading behind the last change event
    notified: RwLock<Option<Reading>>,
    /// Connections lost since startup
    disconnects: AtomicU32,
}

impl SessionHealth {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            since: RwLock::new(Instant::now()),
            last_data: RwLock::new(None),
            notified: RwLock::new(None),
            disconnects: AtomicU32::new(0),
        }
    }

    pub fn get_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Set state and return the previous one. Resets the state clock on change.
    pub fn set_state(&self, state: ConnectionState) -> ConnectionState {
        let prev = ConnectionState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if prev != state {
            *self.since.write().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        }
        prev
    }

    /// Time spent in the current state.
    pub fn state_age(&self) -> Duration {
        self.since
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn record_data(&self, at: Instant) {
        *self.last_data.write().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    /// Time since the last accepted update.
    pub fn last_data_age(&self) -> Option<Duration> {
        self.last_data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|t| t.elapsed())
    }

    fn record_notified(&self, reading: &Reading) {
        *self.notified.write().unwrap_or_else(PoisonError::into_inner) = Some(reading.clone());
    }

    /// Reading the last change event was emitted for.
    pub fn last_notified(&self) -> Option<Reading> {
        self.notified
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_disconnect(&self) -> u32 {
        self.disconnects.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::Relaxed)
    }

    /// Health summary for the /health endpoint.
    pub fn health_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.get_state().as_str(),
            "state_secs": self.state_age().as_secs(),
            "last_data_secs_ago": self.last_data_age().map(|d| d.as_secs()),
            "disconnects": self.disconnects(),
        })
    }
}

impl Default for SessionHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// No update for this long while connected means `Degraded`
    pub staleness_window: Duration,
    /// How often the staleness check runs
    pub watchdog_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl SessionOptions {
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            staleness_window,
            watchdog_interval: Duration::from_secs(15),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

struct SessionInner {
    options: SessionOptions,
    transport: Arc<dyn FeedTransport>,
    store: Arc<ReadingStore>,
    detector: ChangeDetector,
    events: broadcast::Sender<ChangeEvent>,
    health: SessionHealth,
    cancel: CancellationToken,
    wake: Notify,
}

/// Handle to the feed session.
pub struct TelemetrySession {
    inner: Arc<SessionInner>,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl TelemetrySession {
    pub fn new(
        options: SessionOptions,
        transport: Arc<dyn FeedTransport>,
        store: Arc<ReadingStore>,
        detector: ChangeDetector,
        events: broadcast::Sender<ChangeEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                options,
                transport,
                store,
                detector,
                events,
                health: SessionHealth::new(),
                cancel: CancellationToken::new(),
                wake: Notify::new(),
            }),
            task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Start the session task if it is not running.
    ///
    /// Never blocks. If the task is waiting out a reconnect delay, the wait
    /// is cut short. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), MonitorError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(MonitorError::ShutDown);
        }

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                if self.inner.health.get_state() == ConnectionState::Disconnected {
                    debug!("Session waiting to reconnect, retrying now");
                    self.inner.wake.notify_waiters();
                }
                return Ok(());
            }
        }

        self.inner.health.set_state(ConnectionState::Connecting);
        info!("Starting telemetry session for {}", self.inner.transport.describe());

        let session = SessionTask::new(Arc::clone(&self.inner));
        *task = Some(tokio::spawn(session.run()));
        Ok(())
    }

    /// Stop for good: close the connection, cancel reconnect and watchdog,
    /// and wait for the task to exit.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }

        self.inner.health.set_state(ConnectionState::Disconnected);
        info!("Telemetry session shut down");
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.health.get_state()
    }

    pub fn health(&self) -> &SessionHealth {
        &self.inner.health
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }
}

enum ConnectionEnd {
    Shutdown,
    Lost(String),
}

/// State owned by the background task.
struct SessionTask {
    inner: Arc<SessionInner>,
    backoff: Backoff,
    /// Reading of the last emitted event; the detector measures against it
    baseline: Option<Reading>,
    /// Connect time or last accepted update, whichever is later
    last_activity: Option<Instant>,
}

impl SessionTask {
    fn new(inner: Arc<SessionInner>) -> Self {
        let backoff = Backoff::new(inner.options.backoff.clone());
        Self {
            inner,
            backoff,
            baseline: None,
            last_activity: None,
        }
    }

    async fn run(mut self) {
        let cancel = self.inner.cancel.clone();

        loop {
            self.transition(ConnectionState::Connecting);

            let reason = match self.run_connection().await {
                ConnectionEnd::Shutdown => break,
                ConnectionEnd::Lost(reason) => reason,
            };

            // Registered before the state reads Disconnected so a start()
            // that sees Disconnected always lands on this wait.
            let inner = Arc::clone(&self.inner);
            let wake = inner.wake.notified();
            tokio::pin!(wake);

            let delay = self.on_disconnected(&reason);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = &mut wake => {
                    debug!("Reconnect requested, skipping remaining backoff");
                }
            }
        }

        self.transition(ConnectionState::Disconnected);
        debug!("Session task exiting");
    }

    /// Drive one transport connection until it ends or we are cancelled.
    async fn run_connection(&mut self) -> ConnectionEnd {
        let cancel = self.inner.cancel.clone();
        let transport = Arc::clone(&self.inner.transport);
        let (events_tx, mut events_rx) = mpsc::channel(64);

        let connection = transport.run(events_tx);
        tokio::pin!(connection);

        let period = self.inner.options.watchdog_interval;
        let mut watchdog = tokio::time::interval_at(Instant::now() + period, period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return ConnectionEnd::Shutdown,

                Some(event) = events_rx.recv() => self.handle_event(event),

                result = &mut connection => break result,

                _ = watchdog.tick() => self.check_staleness(),
            }
        };

        // Events the transport queued right before returning still count
        while let Ok(event) = events_rx.try_recv() {
            self.handle_event(event);
        }

        ConnectionEnd::Lost(match result {
            Ok(()) => "server closed the stream".to_string(),
            Err(e) => e.to_string(),
        })
    }

    fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Connected => self.on_connected(),
            FeedEvent::Update(update) => self.on_update(update),
        }
    }

    fn on_connected(&mut self) {
        let now = Instant::now();
        self.backoff.on_connected(now);
        self.last_activity = Some(now);
        self.transition(ConnectionState::Connected);
    }

    fn on_update(&mut self, update: RawUpdate) {
        let RawUpdate {
            sequence,
            value,
            timestamp,
            ..
        } = update;

        let Some(raw) = value else {
            debug!(sequence, "Update carried no value, ignoring");
            return;
        };

        let value = match parse_level(&raw) {
            Some(v) => v,
            None => {
                warn!(sequence, raw = %raw, "Discarding unparsable telemetry value");
                return;
            }
        };

        if let (Some(ts), Some(current)) = (timestamp.as_deref(), self.inner.store.get()) {
            if current.feed_timestamp.as_deref() == Some(ts) && current.value == value {
                debug!(sequence, value, feed_timestamp = ts, "Replayed snapshot, skipping");
                return;
            }
        }

        let mut reading = Reading::new(value, Utc::now(), sequence);
        reading.feed_timestamp = timestamp;

        match self.inner.store.set(reading.clone()) {
            StoreOutcome::Stale { current } => {
                debug!(sequence, current, "Dropping out-of-order update");
                return;
            }
            StoreOutcome::Accepted { .. } => {}
        }

        let now = Instant::now();
        self.last_activity = Some(now);
        self.inner.health.record_data(now);
        if self.inner.health.get_state() == ConnectionState::Degraded {
            info!("Telemetry data resumed");
            self.transition(ConnectionState::Connected);
        }

        debug!(sequence, value, "Reading stored");

        if let Some(event) = self.inner.detector.evaluate(self.baseline.as_ref(), &reading) {
            info!(
                value = event.current.value,
                delta = event.delta,
                first = event.is_first(),
                "Significant change"
            );
            self.inner.health.record_notified(&reading);
            self.baseline = Some(reading);
            if self.inner.events.send(event).is_err() {
                debug!("No change event listeners");
            }
        }
    }

    fn on_disconnected(&mut self, reason: &str) -> Duration {
        self.last_activity = None;
        let count = self.inner.health.record_disconnect();
        self.transition(ConnectionState::Disconnected);

        let delay = {
            let mut rng = rand::thread_rng();
            self.backoff.on_disconnected(Instant::now(), &mut rng)
        };
        warn!(
            "Feed connection lost ({}), reconnecting in {:?} (attempt {}, {} disconnects total)",
            reason,
            delay,
            self.backoff.attempts(),
            count
        );
        delay
    }

    fn check_staleness(&mut self) {
        if self.inner.health.get_state() != ConnectionState::Connected {
            return;
        }
        let Some(last) = self.last_activity else {
            return;
        };

        let silent_for = last.elapsed();
        if silent_for > self.inner.options.staleness_window {
            warn!(
                "No telemetry for {:?} (window {:?}), marking degraded",
                silent_for, self.inner.options.staleness_window
            );
            self.transition(ConnectionState::Degraded);
        }
    }

    fn transition(&self, state: ConnectionState) {
        let prev = self.inner.health.set_state(state);
        if prev != state {
            info!("Connection state {} -> {}", prev, state);
        }
    }
}

/// Parse a level value, rejecting NaN and infinities.
fn parse_level(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
