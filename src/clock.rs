//! Elapsed-time source and deadline budgeting.
//!
//! A [`Deadline`] is fixed at construction: remaining time is always
//! `budget - elapsed`, recomputed on demand. Nothing restarts the clock, so a
//! budget spans every send and receive performed under it.

use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// Smallest remaining budget worth waiting on.
pub const MIN_WAIT: Duration = Duration::from_secs(1);

/// Monotonic time elapsed since some fixed epoch.
pub trait Clock {
    fn elapsed(&self) -> Duration;
}

/// [`Clock`] backed by [`Instant`], starting at construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// A wait budget measured against a [`Clock`].
#[derive(Debug, Clone)]
pub struct Deadline<C> {
    clock: C,
    budget: Duration,
}

impl<C: Clock> Deadline<C> {
    pub fn new(clock: C, budget: Duration) -> Self {
        Self { clock, budget }
    }

    /// Total budget, regardless of time already spent.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Replace the budget. Time already elapsed still counts against it.
    pub fn set_budget(&mut self, budget: Duration) {
        self.budget = budget;
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Time left before the budget runs out.
    ///
    /// Fails with [`Error::Timeout`] once less than [`MIN_WAIT`] remains.
    pub fn remaining(&self) -> Result<Duration> {
        let remaining = self.budget.saturating_sub(self.clock.elapsed());
        if remaining < MIN_WAIT {
            return Err(Error::Timeout);
        }
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct ManualClock(Rc<Cell<Duration>>);

    impl ManualClock {
        fn advance(&self, by: Duration) {
            self.0.set(self.0.get() + by);
        }
    }

    impl Clock for ManualClock {
        fn elapsed(&self) -> Duration {
            self.0.get()
        }
    }

    #[test]
    fn test_remaining_shrinks_with_elapsed_time() {
        let clock = ManualClock::default();
        let deadline = Deadline::new(clock.clone(), Duration::from_secs(10));

        assert_eq!(deadline.remaining().unwrap(), Duration::from_secs(10));

        clock.advance(Duration::from_secs(4));
        assert_eq!(deadline.remaining().unwrap(), Duration::from_secs(6));
        assert_eq!(deadline.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn test_timeout_below_min_wait() {
        let clock = ManualClock::default();
        let deadline = Deadline::new(clock.clone(), Duration::from_secs(2));

        clock.advance(Duration::from_millis(1500));
        assert!(matches!(deadline.remaining(), Err(Error::Timeout)));

        // Past the budget entirely
        clock.advance(Duration::from_secs(5));
        assert!(matches!(deadline.remaining(), Err(Error::Timeout)));
    }

    #[test]
    fn test_set_budget_keeps_elapsed() {
        let clock = ManualClock::default();
        let mut deadline = Deadline::new(clock.clone(), Duration::from_secs(300));

        clock.advance(Duration::from_secs(8));
        deadline.set_budget(Duration::from_secs(10));

        assert_eq!(deadline.budget(), Duration::from_secs(10));
        assert_eq!(deadline.remaining().unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let first = clock.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.elapsed() > first);
    }
}
