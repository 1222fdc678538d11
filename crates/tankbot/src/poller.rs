//! Long-polling loop for incoming chat commands.

use std::sync::Arc;
use std::time::Duration;

use tankwatch::{Backoff, BackoffPolicy, ChatId, Monitor};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::{self, Command};
use crate::telegram::{TelegramClient, Update};

pub struct Poller {
    client: Arc<TelegramClient>,
    monitor: Arc<Monitor>,
    bot_username: Option<String>,
    poll_timeout_secs: u64,
    backoff: Backoff,
}

impl Poller {
    pub fn new(
        client: Arc<TelegramClient>,
        monitor: Arc<Monitor>,
        bot_username: Option<String>,
        poll_timeout_secs: u64,
    ) -> Self {
        Self {
            client,
            monitor,
            bot_username,
            poll_timeout_secs,
            backoff: Backoff::new(BackoffPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(60),
                stable_after: Duration::ZERO,
            }),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Poll until cancelled. Each update is handled on its own task so a slow
    /// reply never delays the next poll.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Polling for chat commands");
        let mut offset: Option<i64> = None;

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.client.get_updates(offset, self.poll_timeout_secs) => polled,
            };

            match polled {
                Ok(updates) => {
                    self.backoff.reset();
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        self.spawn_handler(update);
                    }
                }
                Err(e) => {
                    let delay = {
                        let mut rng = rand::thread_rng();
                        self.backoff.on_disconnected(Instant::now(), &mut rng)
                    };
                    let delay = e.retry_after().map_or(delay, |wait| wait.max(delay));
                    warn!("getUpdates failed: {}, retrying in {:?}", e, delay);

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Command polling stopped");
    }

    fn spawn_handler(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let Some(text) = message.text.as_deref() else {
            return;
        };
        let Some(command) = Command::parse(text, self.bot_username.as_deref()) else {
            return;
        };

        let chat = ChatId(message.chat.id);
        let client = Arc::clone(&self.client);
        let monitor = Arc::clone(&self.monitor);

        tokio::spawn(async move {
            debug!(chat_id = %chat, ?command, "Handling command");
            let reply = commands::handle(&command, chat, &monitor);
            if let Err(e) = client.send_message(chat, &reply).await {
                warn!(chat_id = %chat, "Failed to reply: {}", e);
            }
        });
    }
}
