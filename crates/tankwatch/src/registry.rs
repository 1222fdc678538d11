//! Subscriber membership.
//!
//! The registry is the only owner of the subscriber set. When constructed
//! with a file it rewrites that file after every membership change, so the
//! list survives restarts. Inside a tokio runtime the rewrite runs on the
//! blocking pool; membership calls never touch the disk themselves.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Chat identity a notification is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChatId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ChatId)
    }
}

impl From<i64> for ChatId {
    fn from(id: i64) -> Self {
        ChatId(id)
    }
}

/// A registered chat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscriber {
    pub chat_id: ChatId,
    pub subscribed_at: DateTime<Utc>,
}

/// Set of chats that receive change notifications.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    subscribers: Arc<DashMap<ChatId, Subscriber>>,
    file: Option<PathBuf>,
    // serializes snapshot+write so an older list never lands last
    write_lock: Arc<Mutex<()>>,
}

impl SubscriberRegistry {
    /// In-memory registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed by a newline-separated chat id file.
    ///
    /// A missing file is an empty registry. Lines that are not chat ids are
    /// skipped with a warning.
    pub fn with_file(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let subscribers = DashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let loaded_at = Utc::now();
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    match line.parse::<ChatId>() {
                        Ok(chat_id) => {
                            subscribers.insert(
                                chat_id,
                                Subscriber {
                                    chat_id,
                                    subscribed_at: loaded_at,
                                },
                            );
                        }
                        Err(e) => {
                            warn!("Skipping bad subscriber line {:?} in {}: {}", line, path.display(), e);
                        }
                    }
                }
                info!("Loaded {} subscribers from {}", subscribers.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No subscriber file at {}, starting empty", path.display());
            }
            Err(e) => return Err(e),
        }

        Ok(Self {
            subscribers: Arc::new(subscribers),
            file: Some(path),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Add a chat. Returns `true` if it was not already subscribed.
    pub fn add(&self, chat_id: ChatId) -> bool {
        let added = match self.subscribers.entry(chat_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Subscriber {
                    chat_id,
                    subscribed_at: Utc::now(),
                });
                true
            }
        };

        if added {
            info!(chat_id = %chat_id, "Subscriber added");
            self.persist();
        }
        added
    }

    /// Remove a chat. Returns `true` if it was subscribed.
    pub fn remove(&self, chat_id: ChatId) -> bool {
        let removed = self.subscribers.remove(&chat_id).is_some();
        if removed {
            info!(chat_id = %chat_id, "Subscriber removed");
            self.persist();
        }
        removed
    }

    pub fn contains(&self, chat_id: ChatId) -> bool {
        self.subscribers.contains_key(&chat_id)
    }

    /// Snapshot of subscribed chat ids, sorted.
    pub fn list(&self) -> Vec<ChatId> {
        let mut ids: Vec<ChatId> = self.subscribers.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Snapshot of full subscriber records, sorted by chat id.
    pub fn subscribers(&self) -> Vec<Subscriber> {
        let mut subs: Vec<Subscriber> = self.subscribers.iter().map(|e| e.value().clone()).collect();
        subs.sort_by_key(|s| s.chat_id);
        subs
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Write the current list to the backing file now, on this thread.
    pub fn save(&self) -> std::io::Result<()> {
        match self.file.as_deref() {
            Some(path) => save_snapshot(path, &self.subscribers, &self.write_lock),
            None => Ok(()),
        }
    }

    fn persist(&self) {
        let Some(path) = self.file.clone() else {
            return;
        };

        let subscribers = Arc::clone(&self.subscribers);
        let write_lock = Arc::clone(&self.write_lock);
        let write = move || {
            if let Err(e) = save_snapshot(&path, &subscribers, &write_lock) {
                warn!("Failed to save subscribers to {}: {}", path.display(), e);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}

/// Snapshot under the write lock, so whichever write runs last carries every
/// change made before it was queued.
fn save_snapshot(
    path: &Path,
    subscribers: &DashMap<ChatId, Subscriber>,
    write_lock: &Mutex<()>,
) -> std::io::Result<()> {
    let _guard = write_lock.lock().unwrap_or_else(PoisonError::into_inner);
    let mut ids: Vec<ChatId> = subscribers.iter().map(|e| *e.key()).collect();
    ids.sort();
    write_list(path, &ids)
}

/// Write via a sibling temp file and rename, so readers never see half a list.
fn write_list(path: &Path, ids: &[ChatId]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut contents = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
