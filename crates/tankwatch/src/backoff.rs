//! Reconnect delays: capped exponential growth with full jitter.
//!
//! attempt 0: rand[0, base]
//! attempt 1: rand[0, base * 2]
//! attempt n: rand[0, min(base * 2^n, max)]
//!
//! The attempt counter only resets once a connection has stayed up for
//! `stable_after`, so a feed that accepts and immediately drops us keeps
//! backing off instead of hammering the server.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Static backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Ceiling for the first retry
    pub base: Duration,
    /// Cap on the ceiling
    pub max: Duration,
    /// Connected this long counts as stable and resets the attempt counter
    pub stable_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            stable_after: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Upper bound of the delay for a given attempt: `min(base * 2^attempt, max)`.
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        std::cmp::min(self.base.saturating_mul(multiplier), self.max)
    }

    /// Uniformly random delay in `[0, ceiling_for_attempt(attempt)]`.
    pub fn jittered<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempt);
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rng.gen_range(0..=nanos))
    }
}

/// Per-session backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
    connected_since: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            connected_since: None,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Consecutive failed (or unstable) connections so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Mark the start of a connected period.
    pub fn on_connected(&mut self, now: Instant) {
        self.connected_since = Some(now);
    }

    /// Account for a disconnect and return the delay before the next attempt.
    pub fn on_disconnected<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> Duration {
        if let Some(since) = self.connected_since.take() {
            if now.saturating_duration_since(since) >= self.policy.stable_after {
                self.attempts = 0;
            }
        }

        let delay = self.policy.jittered(self.attempts, rng);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Ceiling that the next `on_disconnected` would draw from, ignoring stability.
    pub fn next_ceiling(&self) -> Duration {
        self.policy.ceiling_for_attempt(self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.connected_since = None;
    }
}
