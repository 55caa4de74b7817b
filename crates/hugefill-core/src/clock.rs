//! Injected time source.
//!
//! Trackers stamp their creation time and the demand history advances its
//! epoch wheel from a `Clock`, never from a global. Tests drive a
//! `FakeClock` forward by explicit durations.

use std::cell::Cell;
use std::time::Duration;

/// Cycle-counter style clock: a monotonic tick plus its frequency.
pub trait Clock {
    /// Current time in ticks.
    fn now(&self) -> i64;
    /// Ticks per second.
    fn freq(&self) -> f64;
}

/// Wall clock backed by `std::time::Instant`, reporting nanoseconds.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: std::time::Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }

    fn freq(&self) -> f64 {
        1e9
    }
}

/// Deterministic clock advanced explicitly by tests.
#[derive(Debug)]
pub struct FakeClock {
    ticks: Cell<i64>,
    freq: f64,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    /// Two ticks per nanosecond, an awkward rate on purpose so that
    /// tick/second conversions are exercised.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ticks: Cell::new(1234),
            freq: 2e9,
        }
    }

    pub fn advance(&self, d: Duration) {
        let delta = (d.as_secs_f64() * self.freq) as i64;
        self.ticks.set(self.ticks.get() + delta);
    }

    pub fn reset(&self) {
        self.ticks.set(1234);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> i64 {
        self.ticks.get()
    }

    fn freq(&self) -> f64 {
        self.freq
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> i64 {
        (**self).now()
    }

    fn freq(&self) -> f64 {
        (**self).freq()
    }
}

impl<C: Clock + ?Sized> Clock for std::rc::Rc<C> {
    fn now(&self) -> i64 {
        (**self).now()
    }

    fn freq(&self) -> f64 {
        (**self).freq()
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> i64 {
        (**self).now()
    }

    fn freq(&self) -> f64 {
        (**self).freq()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_by_duration() {
        let c = FakeClock::new();
        let start = c.now();
        c.advance(Duration::from_secs(3));
        assert_eq!(c.now() - start, (3.0 * c.freq()) as i64);
    }

    #[test]
    fn monotonic_clock_moves_forward() {
        let c = MonotonicClock::new();
        let a = c.now();
        let b = c.now();
        assert!(b >= a);
        assert!(c.freq() > 0.0);
    }
}
