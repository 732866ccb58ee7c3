//! Interval ticker - rate-limits periodic maintenance driven by the interactive loop.
//!
//! The interactive thread calls `tick()` every iteration; it returns true at most
//! once per interval. Used for memory sampling / cache cleanup
//! (`cleanup_interval_ms`) without a dedicated timer thread.

use std::time::{Duration, Instant};

/// Fires at most once per interval.
///
/// # Usage
/// ```ignore
/// // In update loop:
/// if ticker.tick() {
///     ctx.maintenance_tick();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct IntervalTicker {
    interval: Duration,
    last_fired: Instant,
}

impl IntervalTicker {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            last_fired: Instant::now(),
        }
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.interval = Duration::from_millis(interval_ms);
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval.as_millis() as u64
    }

    /// True if the interval elapsed since the last fire; restarts the interval.
    pub fn tick(&mut self) -> bool {
        if self.last_fired.elapsed() >= self.interval {
            self.last_fired = Instant::now();
            log::trace!("IntervalTicker: fired ({}ms)", self.interval.as_millis());
            true
        } else {
            false
        }
    }

    /// Restart the interval without firing
    pub fn reset(&mut self) {
        self.last_fired = Instant::now();
    }

    /// Time left until the next fire
    pub fn remaining(&self) -> Duration {
        self.interval.saturating_sub(self.last_fired.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_immediate_fire() {
        let mut ticker = IntervalTicker::new(100);
        assert!(!ticker.tick());
        assert!(ticker.remaining() > Duration::ZERO);
    }

    #[test]
    fn test_fires_once_per_interval() {
        let mut ticker = IntervalTicker::new(10);
        std::thread::sleep(Duration::from_millis(15));

        assert!(ticker.tick());
        // Restarted: next call is too early
        assert!(!ticker.tick());
    }

    #[test]
    fn test_reset_postpones() {
        let mut ticker = IntervalTicker::new(50);
        std::thread::sleep(Duration::from_millis(30));
        ticker.reset();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!ticker.tick());
    }
}
