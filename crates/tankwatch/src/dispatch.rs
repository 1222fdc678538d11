//! Fan-out of change events to subscribers.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::detector::{ChangeEvent, Direction};
use crate::error::SendError;
use crate::registry::{ChatId, SubscriberRegistry};

/// Delivers text to a chat.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<(), SendError>;
}

/// Per-event delivery tally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Failed but kept
    pub transient: usize,
    /// Failed permanently and dropped from the registry
    pub removed: Vec<ChatId>,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.transient + self.removed.len()
    }
}

/// Notification text for a change event.
pub fn render_notification(event: &ChangeEvent) -> String {
    let mut text = String::from("🚽 ISS Urine Tank Update!\n");

    match &event.previous {
        None => {
            text.push_str(&format!("Current level: {:.1}%\n", event.current.value));
            text.push_str("First reading since startup.");
        }
        Some(previous) => {
            let marker = match event.direction() {
                Direction::Rising => " 📈",
                Direction::Falling => " 📉",
                Direction::Steady => "",
            };
            text.push_str(&format!("Previous level: {:.1}%\n", previous.value));
            text.push_str(&format!("Current level: {:.1}%\n", event.current.value));
            text.push_str(&format!("Change: {:+.1}%{}", event.delta, marker));
        }
    }

    text
}

/// Sends each change event to every registered chat.
pub struct NotificationDispatcher {
    registry: Arc<SubscriberRegistry>,
    sender: Arc<dyn MessageSender>,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<SubscriberRegistry>, sender: Arc<dyn MessageSender>) -> Self {
        Self { registry, sender }
    }

    /// Deliver one event to a snapshot of the registry.
    ///
    /// Sends run concurrently; a failing chat never holds up or cancels the
    /// others. Permanent failures remove the chat.
    pub async fn dispatch(&self, event: &ChangeEvent) -> DispatchReport {
        let chats = self.registry.list();
        if chats.is_empty() {
            debug!("No subscribers, skipping notification");
            return DispatchReport::default();
        }

        let text = render_notification(event);
        let sends = chats.iter().map(|&chat| {
            let sender = Arc::clone(&self.sender);
            let text = text.as_str();
            async move { (chat, sender.send_text(chat, text).await) }
        });
        let results = join_all(sends).await;

        let mut report = DispatchReport::default();
        for (chat, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(SendError::Permanent(reason)) => {
                    warn!(chat_id = %chat, "Removing subscriber after permanent failure: {}", reason);
                    self.registry.remove(chat);
                    report.removed.push(chat);
                }
                Err(SendError::Transient(reason)) => {
                    warn!(chat_id = %chat, "Delivery failed, keeping subscriber: {}", reason);
                    report.transient += 1;
                }
            }
        }

        info!(
            delivered = report.delivered,
            transient = report.transient,
            removed = report.removed.len(),
            "Notification dispatched"
        );
        report
    }
}

/// Run the dispatcher against a change event stream until cancelled or the
/// stream closes. A dispatch already underway finishes; none starts after
/// cancellation.
pub fn spawn_dispatch_task(
    dispatcher: Arc<NotificationDispatcher>,
    mut events: broadcast::Receiver<ChangeEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = events.recv() => received,
            };

            match event {
                Ok(event) => {
                    dispatcher.dispatch(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Dispatcher lagged, {} change events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Change event channel closed");
                    break;
                }
            }
        }
        debug!("Dispatch task exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedSender {
        failures: HashMap<ChatId, SendError>,
        sent: Mutex<Vec<(ChatId, String)>>,
    }

    impl ScriptedSender {
        fn failing(failures: impl IntoIterator<Item = (ChatId, SendError)>) -> Self {
            Self {
                failures: failures.into_iter().collect(),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn recipients(&self) -> Vec<ChatId> {
            let mut chats: Vec<ChatId> = self.sent.lock().unwrap().iter().map(|(c, _)| *c).collect();
            chats.sort();
            chats
        }
    }

    #[async_trait]
    impl MessageSender for ScriptedSender {
        async fn send_text(&self, chat: ChatId, text: &str) -> Result<(), SendError> {
            if let Some(err) = self.failures.get(&chat) {
                return Err(err.clone());
            }
            self.sent.lock().unwrap().push((chat, text.to_string()));
            Ok(())
        }
    }

    fn reading(value: f64, sequence: u64) -> Reading {
        Reading::new(value, Utc::now(), sequence)
    }

    fn change(from: f64, to: f64) -> ChangeEvent {
        ChangeEvent {
            previous: Some(reading(from, 1)),
            current: reading(to, 2),
            delta: to - from,
        }
    }

    fn registry_with(chats: &[i64]) -> Arc<SubscriberRegistry> {
        let registry = Arc::new(SubscriberRegistry::new());
        for &chat in chats {
            registry.add(ChatId(chat));
        }
        registry
    }

    #[test]
    fn render_rising_change() {
        assert_eq!(
            render_notification(&change(50.0, 60.0)),
            "🚽 ISS Urine Tank Update!\nPrevious level: 50.0%\nCurrent level: 60.0%\nChange: +10.0% 📈"
        );
    }

    #[test]
    fn render_falling_change() {
        let text = render_notification(&change(72.4, 12.0));
        assert!(text.ends_with("Change: -60.4% 📉"), "{text}");
    }

    #[test]
    fn render_first_reading() {
        let event = ChangeEvent {
            previous: None,
            current: reading(33.0, 1),
            delta: 0.0,
        };
        assert_eq!(
            render_notification(&event),
            "🚽 ISS Urine Tank Update!\nCurrent level: 33.0%\nFirst reading since startup."
        );
    }

    #[tokio::test]
    async fn one_failure_does_not_block_others() {
        let registry = registry_with(&[1, 2, 3]);
        let sender = Arc::new(ScriptedSender::failing([(
            ChatId(1),
            SendError::Transient("timeout".into()),
        )]));
        let dispatcher = NotificationDispatcher::new(Arc::clone(&registry), sender.clone());

        let report = dispatcher.dispatch(&change(10.0, 20.0)).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.transient, 1);
        assert!(report.removed.is_empty());
        assert_eq!(sender.recipients(), vec![ChatId(2), ChatId(3)]);
        assert!(registry.contains(ChatId(1)));
    }

    #[tokio::test]
    async fn permanent_failure_removes_subscriber() {
        let registry = registry_with(&[1, 2]);
        let sender = Arc::new(ScriptedSender::failing([(
            ChatId(2),
            SendError::Permanent("bot was blocked by the user".into()),
        )]));
        let dispatcher = NotificationDispatcher::new(Arc::clone(&registry), sender.clone());

        let report = dispatcher.dispatch(&change(10.0, 20.0)).await;

        assert_eq!(report.removed, vec![ChatId(2)]);
        assert_eq!(report.attempted(), 2);
        assert_eq!(registry.list(), vec![ChatId(1)]);
    }

    #[tokio::test]
    async fn empty_registry_sends_nothing() {
        let sender = Arc::new(ScriptedSender::default());
        let dispatcher = NotificationDispatcher::new(registry_with(&[]), sender.clone());

        let report = dispatcher.dispatch(&change(1.0, 9.0)).await;

        assert_eq!(report, DispatchReport::default());
        assert!(sender.recipients().is_empty());
    }

    #[tokio::test]
    async fn task_delivers_events_until_cancelled() {
        let registry = registry_with(&[5]);
        let sender = Arc::new(ScriptedSender::default());
        let dispatcher = Arc::new(NotificationDispatcher::new(registry, sender.clone()));
        let (tx, rx) = broadcast::channel(8);
        let cancel = CancellationToken::new();

        let handle = spawn_dispatch_task(dispatcher, rx, cancel.clone());
        tx.send(change(1.0, 9.0)).unwrap();

        for _ in 0..100 {
            if !sender.recipients().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(sender.recipients(), vec![ChatId(5)]);

        cancel.cancel();
        handle.await.unwrap();

        // Nothing is listening any more
        let _ = tx.send(change(9.0, 20.0));
        assert_eq!(sender.recipients().len(), 1);
    }
}
