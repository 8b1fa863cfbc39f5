use std::hint;
use std::thread;

/// Spin limit as a power of two; beyond it the thread yields.
const SPIN_LIMIT: u32 = 6;
/// Total attempts before the caller falls back to a blocking acquire.
const YIELD_LIMIT: u32 = 10;

/// Bounded exponential backoff for contended shard locks.
#[derive(Debug, Default)]
pub(super) struct Backoff {
    step: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Waits a little. Returns false once the retry budget is spent.
    pub fn snooze(&mut self) -> bool {
        if self.step > YIELD_LIMIT {
            return false;
        }

        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }

        self.step += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        let mut backoff = Backoff::new();
        let mut attempts = 0;
        while backoff.snooze() {
            attempts += 1;
        }
        assert_eq!(attempts, YIELD_LIMIT + 1);
        assert!(!backoff.snooze());
    }
}
