//! Per-connection limits for WebSocket sessions.
//!
//! These sit on top of request admission: a [`SessionWindow`] caps how many
//! messages one connection may send per window, and a [`ConnectionTracker`]
//! caps how many connections one API key may hold open at once.

use core::time::Duration;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::time::Instant;

/// Sliding-log message limit for a single connection.
///
/// A `limit` of zero or an empty `window` disables the check.
#[derive(Debug)]
pub struct SessionWindow {
    limit: usize,
    window: Duration,
    events: VecDeque<Instant>,
}

impl SessionWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            events: VecDeque::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0 && !self.window.is_zero()
    }

    /// Records one message if the window has room for it.
    ///
    /// Returns whether the message is allowed and how many more fit in the
    /// current window.
    pub fn allow(&mut self) -> (bool, usize) {
        if !self.is_enabled() {
            return (true, usize::MAX);
        }
        let now = Instant::now();
        self.evict(now);
        if self.events.len() >= self.limit {
            return (false, 0);
        }
        self.events.push_back(now);
        (true, self.limit - self.events.len())
    }

    /// Whole seconds until the oldest message leaves the window; zero when
    /// the window is not full.
    pub fn retry_after(&mut self) -> u64 {
        if !self.is_enabled() {
            return 0;
        }
        let now = Instant::now();
        self.evict(now);
        if self.events.len() < self.limit {
            return 0;
        }
        let Some(oldest) = self.events.front() else {
            return 0;
        };
        let wait = self.window.saturating_sub(now.duration_since(*oldest));
        (wait.as_secs_f64().ceil() as u64).max(1)
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.events.front() {
            if now.duration_since(*oldest) < self.window {
                break;
            }
            self.events.pop_front();
        }
    }
}

/// Counts open WebSocket connections per API key.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: Mutex<HashMap<String, usize>>,
}

impl ConnectionTracker {
    /// Claims a slot for `key`. Keys are compared case-insensitively and a
    /// `limit` of zero admits everything.
    ///
    /// # Errors
    ///
    /// Returns the number of connections already open for `key` when it is
    /// at `limit`.
    pub fn acquire(self: &Arc<Self>, key: &str, limit: usize) -> Result<ConnectionPermit, usize> {
        let key = key.to_lowercase();
        let mut active = self.active.lock();
        let count = active.entry(key.clone()).or_insert(0);
        if limit > 0 && *count >= limit {
            return Err(*count);
        }
        *count += 1;
        Ok(ConnectionPermit {
            tracker: Arc::clone(self),
            key,
        })
    }

    pub fn active(&self, key: &str) -> usize {
        self.active
            .lock()
            .get(&key.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, key: &str) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(key);
            }
        }
    }
}

/// One open connection; releases its slot when dropped.
#[derive(Debug)]
pub struct ConnectionPermit {
    tracker: Arc<ConnectionTracker>,
    key: String,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.tracker.release(&self.key);
    }
}
