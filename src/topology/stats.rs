use std::sync::atomic::{AtomicU64, Ordering};

/// Per-interval stage counts, as returned by [`TopologyStats::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub received: u64,
    pub filtered: u64,
    pub aggregated: u64,
    pub late: u64,
    pub dead_lettered: u64,
}

impl StageCounts {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Lock-free per-stage counters.
///
/// `snapshot()` reads and resets all counters, making it suitable for
/// periodic reporting without contention.
#[derive(Debug, Default)]
pub struct TopologyStats {
    received: AtomicU64,
    filtered: AtomicU64,
    aggregated: AtomicU64,
    late: AtomicU64,
    dead_lettered: AtomicU64,
}

impl TopologyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aggregated(&self) {
        self.aggregated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late(&self) {
        self.late.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> StageCounts {
        StageCounts {
            received: self.received.swap(0, Ordering::Relaxed),
            filtered: self.filtered.swap(0, Ordering::Relaxed),
            aggregated: self.aggregated.swap(0, Ordering::Relaxed),
            late: self.late.swap(0, Ordering::Relaxed),
            dead_lettered: self.dead_lettered.swap(0, Ordering::Relaxed),
        }
    }
}
