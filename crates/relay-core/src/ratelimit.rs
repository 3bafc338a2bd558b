//! Sliding-window rate limiting.
//!
//! A [`RateLimiter`] keeps, per key, the instants of recently admitted
//! events. Keys are caller-defined: the REST layer keys by user, a session
//! keys its own limiter by the owning user.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Per-key sliding-window admission control.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum admitted events per window.
    limit: usize,
    /// Window length.
    window: Duration,
    /// Admitted instants per key, oldest first.
    requests: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter admitting `limit` events per `window` for each key.
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            requests: DashMap::new(),
        }
    }

    /// Get the configured window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit or reject one event for `key`.
    ///
    /// Returns `true` and records the event if fewer than `limit` events
    /// were admitted for this key within the last window.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();

        let mut timestamps = match self.requests.get_mut(key) {
            Some(entry) => entry,
            None => self.requests.entry(key.to_owned()).or_default(),
        };

        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.limit {
            trace!(key = %key, limit = self.limit, "Rate limit exceeded");
            return false;
        }

        timestamps.push_back(now);
        true
    }

    /// Drop keys whose admitted events have all left the window.
    ///
    /// Returns the number of keys removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.requests.len();
        self.requests.retain(|_, timestamps| {
            timestamps
                .back()
                .is_some_and(|latest| now.duration_since(*latest) < self.window)
        });
        before - self.requests.len()
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.requests.len()
    }
}
