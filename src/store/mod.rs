//! In-memory windowed count store.
//!
//! Counts live in a [`DashMap`] keyed by aggregation key; each entry holds
//! the key's windows in start order. Increments for one key serialize on
//! that key's shard lock while disjoint keys proceed in parallel. Eviction
//! collects candidates first and then locks one key at a time.

pub mod aggregate;
mod backoff;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use dashmap::try_result::TryResult;
use dashmap::DashMap;
use thiserror::Error;

use crate::event::EventTime;
use crate::window::Window;

pub use self::aggregate::{Aggregate, WindowCount, WindowedKey};
use self::aggregate::CountCell;
use self::backoff::Backoff;

/// Store-side rejection of an increment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("window {window} is closed (retention ended before eviction horizon {horizon})")]
    WindowClosed { window: Window, horizon: EventTime },
}

/// Windows of a single aggregation key, ordered by start.
type KeyWindows = BTreeMap<Window, CountCell>;

/// Counters describing store activity since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub aggregates: usize,
    pub keys: usize,
    pub contention_retries: u64,
    pub evicted: u64,
    pub rejected_closed: u64,
}

/// Holds current counts per [`WindowedKey`].
pub struct AggregationStore {
    entries: DashMap<String, KeyWindows>,
    grace_ms: i64,
    /// Highest watermark an eviction sweep has run against.
    horizon: AtomicI64,
    live: AtomicUsize,
    contention_retries: AtomicU64,
    evicted: AtomicU64,
    rejected_closed: AtomicU64,
}

impl AggregationStore {
    /// Creates an empty store with the given grace period in milliseconds.
    pub fn new(grace_ms: i64) -> Self {
        Self {
            entries: DashMap::with_capacity(256),
            grace_ms: grace_ms.max(0),
            horizon: AtomicI64::new(EventTime::MIN),
            live: AtomicUsize::new(0),
            contention_retries: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            rejected_closed: AtomicU64::new(0),
        }
    }

    pub fn grace_ms(&self) -> i64 {
        self.grace_ms
    }

    /// Time a window is kept past its end before it may be evicted.
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms as u64)
    }

    /// Current eviction horizon.
    pub fn horizon(&self) -> EventTime {
        self.horizon.load(Ordering::SeqCst)
    }

    /// Increments a single windowed count, creating it at 1 if absent.
    pub fn increment(&self, windowed_key: &WindowedKey) -> Result<Aggregate, StoreError> {
        let now = SystemTime::now();
        let window = windowed_key.window;

        self.with_key_mut(&windowed_key.key, |cells| {
            self.check_open(std::slice::from_ref(&window))?;
            Ok(self.bump(cells, window, now).snapshot(&windowed_key.key, window))
        })
    }

    /// Applies one event to every given window of `key`.
    ///
    /// All windows are checked against the eviction horizon under the
    /// key's lock before any is touched, so the increment is all-or-nothing.
    pub fn increment_all(&self, key: &str, windows: &[Window]) -> Result<Vec<Aggregate>, StoreError> {
        let now = SystemTime::now();

        self.with_key_mut(key, |cells| {
            self.check_open(windows)?;
            Ok(windows
                .iter()
                .map(|window| self.bump(cells, *window, now).snapshot(key, *window))
                .collect())
        })
    }

    /// Must be called with the key's lock held.
    fn check_open(&self, windows: &[Window]) -> Result<(), StoreError> {
        let horizon = self.horizon.load(Ordering::SeqCst);
        match windows.iter().find(|w| w.is_closed(self.grace_ms, horizon)) {
            Some(closed) => {
                self.rejected_closed.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::WindowClosed {
                    window: *closed,
                    horizon,
                })
            }
            None => Ok(()),
        }
    }

    fn bump<'c>(&self, cells: &'c mut KeyWindows, window: Window, now: SystemTime) -> &'c CountCell {
        let cell = cells.entry(window).or_insert_with(|| {
            self.live.fetch_add(1, Ordering::Relaxed);
            CountCell::new(now)
        });
        cell.increment(now);
        cell
    }

    /// Point lookup.
    pub fn get(&self, windowed_key: &WindowedKey) -> Option<Aggregate> {
        let entry = self.entries.get(windowed_key.key.as_str())?;
        entry
            .get(&windowed_key.window)
            .map(|cell| cell.snapshot(&windowed_key.key, windowed_key.window))
    }

    /// Lazily iterates a key's aggregates by ascending window start.
    ///
    /// Every step reads live state. The iterator stops at the last window
    /// present when it was created, so it is always finite; create a new
    /// one to observe windows added since.
    pub fn range_by_key(&self, key: &str) -> RangeByKey<'_> {
        self.range_between(key, EventTime::MIN, EventTime::MAX)
    }

    /// Like [`range_by_key`](Self::range_by_key), restricted to window
    /// starts in `[from_start, to_start]`.
    pub fn range_between(&self, key: &str, from_start: EventTime, to_start: EventTime) -> RangeByKey<'_> {
        let last = self
            .entries
            .get(key)
            .and_then(|cells| cells.keys().next_back().map(|w| w.start));
        let upper = match last {
            Some(last) => last.min(to_start),
            None => EventTime::MIN,
        };

        RangeByKey {
            store: self,
            key: key.to_string(),
            cursor: None,
            from_start,
            upper,
            done: last.is_none() || from_start > to_start,
        }
    }

    /// Removes every aggregate whose `window.end + grace <= watermark`.
    ///
    /// `on_final` sees each aggregate's last value before it is removed.
    /// Returns the evicted identities in the order they were removed.
    pub fn evict_expired<F>(&self, watermark: EventTime, mut on_final: F) -> Vec<WindowedKey>
    where
        F: FnMut(&Aggregate),
    {
        // Raise the horizon first: increments that lock a key after this
        // point are rejected, earlier ones are caught by the scan below.
        self.horizon.fetch_max(watermark, Ordering::SeqCst);
        let horizon = self.horizon.load(Ordering::SeqCst);
        let grace_ms = self.grace_ms;

        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| match entry.value().keys().next() {
                Some(oldest) => oldest.is_closed(grace_ms, horizon),
                None => true,
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for key in candidates {
            if let Some(mut cells) = self.entries.get_mut(key.as_str()) {
                // Windows share one size, so closed windows form a prefix.
                while let Some((window, cell)) = cells.first_key_value() {
                    if !window.is_closed(grace_ms, horizon) {
                        break;
                    }
                    let snapshot = cell.snapshot(&key, *window);
                    on_final(&snapshot);
                    cells.pop_first();
                    self.live.fetch_sub(1, Ordering::Relaxed);
                    evicted.push(snapshot.windowed_key);
                }
            }
            self.entries.remove_if(key.as_str(), |_, cells| cells.is_empty());
        }

        self.evicted
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        evicted
    }

    /// Number of live aggregates.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of aggregation keys with at least one entry.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            aggregates: self.len(),
            keys: self.key_count(),
            contention_retries: self.contention_retries.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            rejected_closed: self.rejected_closed.load(Ordering::Relaxed),
        }
    }

    /// Runs `f` with exclusive access to `key`'s windows.
    ///
    /// A locked shard is retried with bounded backoff before falling back
    /// to a blocking acquire; contention never surfaces to the caller.
    fn with_key_mut<R>(&self, key: &str, f: impl FnOnce(&mut KeyWindows) -> R) -> R {
        let mut backoff = Backoff::new();
        loop {
            match self.entries.try_get_mut(key) {
                TryResult::Present(mut cells) => return f(cells.value_mut()),
                TryResult::Absent => break,
                TryResult::Locked => {
                    self.contention_retries.fetch_add(1, Ordering::Relaxed);
                    if !backoff.snooze() {
                        break;
                    }
                }
            }
        }

        let mut cells = self.entries.entry(key.to_string()).or_default();
        let out = f(cells.value_mut());
        let emptied = cells.is_empty();
        drop(cells);

        // A rejected first increment must not leave an empty key behind.
        if emptied {
            self.entries.remove_if(key, |_, cells| cells.is_empty());
        }
        out
    }

    /// Reads the window after `cursor` (or the first at/after `from_start`).
    fn next_after(&self, key: &str, cursor: Option<Window>, from_start: EventTime) -> Option<Aggregate> {
        let cells = self.entries.get(key)?;
        let lower = match cursor {
            Some(w) => Bound::Excluded(w),
            None => Bound::Included(Window {
                start: from_start,
                end: EventTime::MIN,
            }),
        };
        cells
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(window, cell)| cell.snapshot(key, *window))
    }
}

impl Default for AggregationStore {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Lazy, restartable iterator over one key's aggregates.
pub struct RangeByKey<'a> {
    store: &'a AggregationStore,
    key: String,
    cursor: Option<Window>,
    from_start: EventTime,
    upper: EventTime,
    done: bool,
}

impl Iterator for RangeByKey<'_> {
    type Item = Aggregate;

    fn next(&mut self) -> Option<Aggregate> {
        if self.done {
            return None;
        }

        match self.store.next_after(&self.key, self.cursor, self.from_start) {
            Some(agg) if agg.window().start <= self.upper => {
                self.cursor = Some(agg.window());
                Some(agg)
            }
            _ => {
                self.done = true;
                None
            }
        }
    }
}
