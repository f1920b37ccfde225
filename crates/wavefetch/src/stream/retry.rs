//! Single-shot retry timer with linearly escalating delay
//!
//! The scheduler never sleeps on the caller's thread: a pending retry is a
//! `crossbeam_channel::after` timer that the owning worker selects on, and
//! `fire()` hands the stored action back once it elapses.

use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, Receiver};

struct Pending<A> {
    action: A,
    timer: Receiver<Instant>,
}

/// Retry coordinator: one pending action at a time, delay grows by one
/// `step` per firing up to `max`.
pub struct RetryScheduler<A> {
    step: Duration,
    max: Duration,
    interval: Duration,
    attempts: u32,
    pending: Option<Pending<A>>,
    idle: Receiver<Instant>,
}

impl<A> RetryScheduler<A> {
    /// `step` is both the first delay and the increment.
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max: max.max(step),
            interval: step,
            attempts: 0,
            pending: None,
            idle: never(),
        }
    }

    /// Schedule `action` after the current interval.
    ///
    /// Returns the delay used, or `None` if a retry was already pending (the
    /// new action is dropped in that case).
    pub fn retry(&mut self, action: A) -> Option<Duration> {
        if self.pending.is_some() {
            return None;
        }
        let delay = self.interval;
        self.pending = Some(Pending {
            action,
            timer: after(delay),
        });
        Some(delay)
    }

    /// Timer to select on; never fires while nothing is pending.
    pub fn timer(&self) -> &Receiver<Instant> {
        match self.pending {
            Some(ref p) => &p.timer,
            None => &self.idle,
        }
    }

    /// Take the pending action and escalate the interval.
    pub fn fire(&mut self) -> Option<A> {
        let pending = self.pending.take()?;
        self.attempts += 1;
        self.interval = (self.interval + self.step).min(self.max);
        Some(pending.action)
    }

    /// Drop the pending action. The interval is left where it is.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Cancel and return the interval to its floor (new seek/session).
    pub fn reset(&mut self) {
        self.pending = None;
        self.interval = self.step;
        self.attempts = 0;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Retries fired since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn escalates_by_one_unit_up_to_max() {
        let mut r = RetryScheduler::new(secs(1), secs(5));
        let mut delays = Vec::new();
        for i in 0..8 {
            delays.push(r.retry(i).unwrap().as_secs());
            assert_eq!(r.fire(), Some(i));
        }
        assert_eq!(delays, vec![1, 2, 3, 4, 5, 5, 5, 5]);
    }

    #[test]
    fn retry_while_pending_is_noop() {
        let mut r = RetryScheduler::new(secs(1), secs(5));
        assert_eq!(r.retry("first"), Some(secs(1)));
        assert_eq!(r.retry("second"), None);
        assert_eq!(r.fire(), Some("first"));
        assert_eq!(r.fire(), None);
    }

    #[test]
    fn cancel_keeps_interval() {
        let mut r = RetryScheduler::new(secs(1), secs(5));
        r.retry(());
        r.fire();
        r.retry(());
        r.fire();
        r.retry(());
        r.cancel();
        assert!(!r.is_pending());
        assert_eq!(r.retry(()), Some(secs(3)));
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut r = RetryScheduler::new(secs(1), secs(5));
        for _ in 0..4 {
            r.retry(());
            r.fire();
        }
        assert_eq!(r.attempts(), 4);
        assert_eq!(r.retry(()), Some(secs(5)));
        r.cancel();
        r.reset();
        assert_eq!(r.attempts(), 0);
        assert_eq!(r.retry(()), Some(secs(1)));
    }

    #[test]
    fn timer_fires_after_delay() {
        let mut r = RetryScheduler::new(Duration::from_millis(20), Duration::from_millis(100));
        r.retry(42);
        let start = Instant::now();
        r.timer().recv().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(r.fire(), Some(42));
    }

    #[test]
    fn idle_timer_never_fires() {
        let r: RetryScheduler<()> = RetryScheduler::new(secs(1), secs(5));
        assert!(r
            .timer()
            .recv_timeout(Duration::from_millis(20))
            .is_err());
    }
}
