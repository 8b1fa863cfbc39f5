use std::fmt;
use std::time::SystemTime;

use serde::Serialize;

use crate::event::EventTime;
use crate::window::Window;

/// Identity of an aggregate: aggregation key plus window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowedKey {
    pub key: String,
    pub window: Window,
}

impl WindowedKey {
    pub fn new(key: impl Into<String>, window: Window) -> Self {
        Self {
            key: key.into(),
            window,
        }
    }
}

impl fmt::Display for WindowedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.window)
    }
}

/// Point-in-time view of a single windowed count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub windowed_key: WindowedKey,
    pub count: u64,
    /// Wall-clock time of the latest increment.
    pub last_updated: SystemTime,
}

impl Aggregate {
    pub fn key(&self) -> &str {
        &self.windowed_key.key
    }

    pub fn window(&self) -> Window {
        self.windowed_key.window
    }

    /// Wire shape used by the query endpoint.
    pub fn to_window_count(&self) -> WindowCount {
        WindowCount {
            window_start: self.windowed_key.window.start,
            window_end: self.windowed_key.window.end,
            count: self.count,
        }
    }
}

/// JSON shape returned by queries: `{windowStart, windowEnd, count}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowCount {
    pub window_start: EventTime,
    pub window_end: EventTime,
    pub count: u64,
}

/// Mutable counter held inside the store. Only touched under the key's lock.
#[derive(Debug, Clone, Copy)]
pub(super) struct CountCell {
    pub count: u64,
    pub last_updated: SystemTime,
}

impl CountCell {
    pub fn new(now: SystemTime) -> Self {
        Self {
            count: 0,
            last_updated: now,
        }
    }

    pub fn increment(&mut self, now: SystemTime) {
        self.count = self.count.saturating_add(1);
        self.last_updated = now;
    }

    pub fn snapshot(&self, key: &str, window: Window) -> Aggregate {
        Aggregate {
            windowed_key: WindowedKey::new(key, window),
            count: self.count,
            last_updated: self.last_updated,
        }
    }
}
