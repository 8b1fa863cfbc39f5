use std::sync::atomic::{AtomicI64, Ordering};

use crate::event::EventTime;

/// Monotonic event-time high-water mark.
///
/// Shared by reference between the topology, which advances it, and the
/// eviction task, which reads it. Readers only ever see a snapshot.
#[derive(Debug)]
pub struct Watermark {
    value: AtomicI64,
}

impl Watermark {
    /// Starts below every representable event time.
    pub fn new() -> Self {
        Self::starting_at(EventTime::MIN)
    }

    pub fn starting_at(value: EventTime) -> Self {
        Self {
            value: AtomicI64::new(value),
        }
    }

    /// Current value.
    pub fn current(&self) -> EventTime {
        self.value.load(Ordering::SeqCst)
    }

    /// Raises the watermark to `candidate` if it is ahead. Returns the
    /// value after the update.
    pub fn advance(&self, candidate: EventTime) -> EventTime {
        let prev = self.value.fetch_max(candidate, Ordering::SeqCst);
        prev.max(candidate)
    }

    /// True until the first event has advanced the watermark.
    pub fn is_unset(&self) -> bool {
        self.current() == EventTime::MIN
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new()
    }
}
