//! Latest-value store.
//!
//! One writer (the session task) and any number of status readers. A reading
//! is only accepted when its sequence is strictly greater than the stored one,
//! so replays and reordered updates leave the store untouched.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single telemetry observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Tank level, in percent.
    pub value: f64,
    /// Local time the update was received.
    pub observed_at: DateTime<Utc>,
    /// Feed-assigned ordering key.
    pub sequence: u64,
    /// Raw timestamp field from the feed, for display only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_timestamp: Option<String>,
}

impl Reading {
    pub fn new(value: f64, observed_at: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            value,
            observed_at,
            sequence,
            feed_timestamp: None,
        }
    }

    pub fn with_feed_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.feed_timestamp = Some(timestamp.into());
        self
    }

    /// Time elapsed between observation and `now`, clamped at zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.observed_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Result of offering a reading to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    /// Stored; carries whatever it replaced.
    Accepted { replaced: Option<Reading> },
    /// Dropped because the store already holds `current` or newer.
    Stale { current: u64 },
}

impl StoreOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StoreOutcome::Accepted { .. })
    }
}

/// Holds the single most recent reading.
#[derive(Debug, Default)]
pub struct ReadingStore {
    latest: RwLock<Option<Reading>>,
}

impl ReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored reading unless `reading` is not newer.
    pub fn set(&self, reading: Reading) -> StoreOutcome {
        let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = latest.as_ref() {
            if reading.sequence <= current.sequence {
                return StoreOutcome::Stale {
                    current: current.sequence,
                };
            }
        }

        let replaced = latest.replace(reading);
        StoreOutcome::Accepted { replaced }
    }

    /// Latest reading, or `None` if nothing has arrived since startup.
    pub fn get(&self) -> Option<Reading> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sequence of the stored reading, if any.
    pub fn sequence(&self) -> Option<u64> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.sequence)
    }

    /// Age of the latest reading relative to `now`.
    pub fn age_since(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.age_at(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn empty_store() {
        let store = ReadingStore::new();
        assert_eq!(store.get(), None);
        assert_eq!(store.age_since(at(0)), None);
        assert_eq!(store.sequence(), None);
    }

    #[test]
    fn keeps_highest_sequence() {
        let store = ReadingStore::new();

        for (seq, value) in [(1, 50.0), (2, 50.5), (5, 60.0), (9, 61.0)] {
            assert!(store.set(Reading::new(value, at(seq as i64), seq)).is_accepted());
            assert_eq!(store.get().unwrap().sequence, seq);
        }

        assert_eq!(store.get().unwrap().value, 61.0);
    }

    #[test]
    fn rejects_stale_and_duplicate_sequences() {
        let store = ReadingStore::new();
        store.set(Reading::new(60.0, at(3), 3));

        assert_eq!(
            store.set(Reading::new(58.0, at(4), 2)),
            StoreOutcome::Stale { current: 3 }
        );
        assert_eq!(
            store.set(Reading::new(70.0, at(4), 3)),
            StoreOutcome::Stale { current: 3 }
        );

        let kept = store.get().unwrap();
        assert_eq!(kept.value, 60.0);
        assert_eq!(kept.observed_at, at(3));
    }

    #[test]
    fn accepted_reports_replaced_reading() {
        let store = ReadingStore::new();
        assert_eq!(
            store.set(Reading::new(1.0, at(0), 1)),
            StoreOutcome::Accepted { replaced: None }
        );

        match store.set(Reading::new(2.0, at(1), 2)) {
            StoreOutcome::Accepted { replaced: Some(prev) } => assert_eq!(prev.value, 1.0),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn age_is_clamped_for_future_readings() {
        let store = ReadingStore::new();
        store.set(Reading::new(42.0, at(100), 1));

        assert_eq!(store.age_since(at(130)), Some(Duration::from_secs(30)));
        assert_eq!(store.age_since(at(50)), Some(Duration::ZERO));
    }

    #[test]
    fn concurrent_writers_converge_on_max_sequence() {
        let store = Arc::new(ReadingStore::new());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..250u64 {
                        let seq = i * 4 + t;
                        store.set(Reading::new(seq as f64, at(0), seq));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.sequence(), Some(999));
    }
}
