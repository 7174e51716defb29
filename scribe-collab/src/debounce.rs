//! Trailing-edge debouncing as plain state.
//!
//! The caller supplies the clock, so the same state machine serves the
//! async driver (which sleeps until [`Debouncer::deadline`]) and tests
//! (which pass hand-made instants).

use std::time::{Duration, Instant};

/// Holds the latest scheduled value until `interval` passes without a
/// newer one. Intermediate values are dropped.
#[derive(Debug, Clone)]
pub struct Debouncer<T> {
    interval: Duration,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T> Debouncer<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            deadline: None,
        }
    }

    /// Replace the pending value and restart the quiet interval.
    pub fn schedule(&mut self, value: T, now: Instant) {
        self.pending = Some(value);
        self.deadline = Some(now + self.interval);
    }

    /// Take the pending value once its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Take the pending value immediately.
    pub fn flush(&mut self) -> Option<T> {
        self.deadline = None;
        self.pending.take()
    }

    /// Drop the pending value.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.pending = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_burst_coalesces_to_last_value() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(500 * MS);
        for i in 0..5u32 {
            debouncer.schedule(i, start + 20 * i * MS);
        }
        assert_eq!(debouncer.poll(start + 400 * MS), None);
        assert_eq!(debouncer.poll(start + 580 * MS), Some(4));
        assert_eq!(debouncer.poll(start + 2000 * MS), None);
        assert!(!debouncer.is_pending());
    }

    #[test]
    fn test_reschedule_pushes_deadline() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(100 * MS);
        debouncer.schedule("a", start);
        debouncer.schedule("b", start + 90 * MS);
        assert_eq!(debouncer.poll(start + 150 * MS), None);
        assert_eq!(debouncer.deadline(), Some(start + 190 * MS));
        assert_eq!(debouncer.poll(start + 190 * MS), Some("b"));
    }

    #[test]
    fn test_cancel_and_flush() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(100 * MS);
        debouncer.schedule(1, start);
        debouncer.cancel();
        assert_eq!(debouncer.poll(start + 1000 * MS), None);
        assert_eq!(debouncer.deadline(), None);

        debouncer.schedule(2, start);
        assert_eq!(debouncer.flush(), Some(2));
        assert!(!debouncer.is_pending());
    }
}
