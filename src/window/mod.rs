use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::event::EventTime;

/// Invalid window geometry. Fatal at startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WindowError {
    #[error("window size must be positive")]
    ZeroSize,

    #[error("window hop must be positive")]
    ZeroHop,

    #[error("window hop {hop_ms}ms must not exceed window size {size_ms}ms")]
    HopExceedsSize { size_ms: i64, hop_ms: i64 },

    #[error("window duration {0:?} does not fit in i64 milliseconds")]
    TooLarge(Duration),

    #[error("timestamp {timestamp} has no representable window")]
    OutOfRange { timestamp: EventTime },
}

/// Half-open event-time window `[start, end)` in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Window {
    pub start: EventTime,
    pub end: EventTime,
}

impl Window {
    /// Return true if `timestamp` falls inside this window.
    pub fn contains(&self, timestamp: EventTime) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Event time at which the window stops accepting data and may be evicted.
    pub fn retention_end(&self, grace_ms: i64) -> EventTime {
        self.end.saturating_add(grace_ms)
    }

    /// Whether the window is closed for the given watermark.
    pub fn is_closed(&self, grace_ms: i64, watermark: EventTime) -> bool {
        self.retention_end(grace_ms) <= watermark
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Maps event timestamps to fixed-size windows advancing by a fixed hop.
///
/// `size == hop` gives tumbling windows, `size > hop` hopping windows.
/// Window starts are aligned to multiples of `hop` from the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssigner {
    size_ms: i64,
    hop_ms: i64,
}

impl WindowAssigner {
    /// Creates an assigner, rejecting zero sizes and hops larger than the size.
    pub fn new(size: Duration, hop: Duration) -> Result<Self, WindowError> {
        let size_ms = to_millis(size)?;
        let hop_ms = to_millis(hop)?;
        Self::from_millis(size_ms, hop_ms)
    }

    pub fn from_millis(size_ms: i64, hop_ms: i64) -> Result<Self, WindowError> {
        if size_ms <= 0 {
            return Err(WindowError::ZeroSize);
        }
        if hop_ms <= 0 {
            return Err(WindowError::ZeroHop);
        }
        if hop_ms > size_ms {
            return Err(WindowError::HopExceedsSize { size_ms, hop_ms });
        }
        Ok(Self { size_ms, hop_ms })
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    pub fn hop_ms(&self) -> i64 {
        self.hop_ms
    }

    pub fn is_tumbling(&self) -> bool {
        self.size_ms == self.hop_ms
    }

    /// Upper bound on the number of windows a single timestamp maps to.
    pub fn max_windows_per_event(&self) -> usize {
        let n = (self.size_ms - 1) / self.hop_ms + 1;
        usize::try_from(n).unwrap_or(usize::MAX)
    }

    /// Returns every window containing `timestamp`, ascending by start.
    pub fn assign(&self, timestamp: EventTime) -> Result<Vec<Window>, WindowError> {
        let mut windows = Vec::with_capacity(self.max_windows_per_event());
        self.assign_into(timestamp, &mut windows)?;
        Ok(windows)
    }

    /// Like [`assign`](Self::assign) but reuses the caller's buffer.
    ///
    /// Timestamps within one window size of either end of the `i64` range
    /// are rejected, so every window end below is representable.
    pub fn assign_into(
        &self,
        timestamp: EventTime,
        out: &mut Vec<Window>,
    ) -> Result<(), WindowError> {
        out.clear();

        let out_of_range = || WindowError::OutOfRange { timestamp };
        let lower = timestamp.checked_sub(self.size_ms).ok_or_else(out_of_range)?;
        timestamp.checked_add(self.size_ms).ok_or_else(out_of_range)?;

        let mut start = timestamp - timestamp.rem_euclid(self.hop_ms);
        // Walk back while the window still covers the timestamp.
        while start > lower {
            out.push(Window {
                start,
                end: start + self.size_ms,
            });
            match start.checked_sub(self.hop_ms) {
                Some(prev) => start = prev,
                None => break,
            }
        }

        out.reverse();
        Ok(())
    }
}

fn to_millis(d: Duration) -> Result<i64, WindowError> {
    i64::try_from(d.as_millis()).map_err(|_| WindowError::TooLarge(d))
}
