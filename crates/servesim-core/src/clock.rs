//! Virtual clock for discrete-event simulation.
//!
//! The [`SimClock`] tracks simulated time as an integer count of microseconds,
//! independent of wall-clock time. It advances only when the event queue
//! hands out the next event, so runs are repeatable on any host.

use serde::{Deserialize, Serialize};

/// Virtual simulation clock, in integer microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimClock {
    current_us: u64,
}

impl SimClock {
    /// Create a new clock starting at time zero.
    pub fn new() -> Self {
        Self { current_us: 0 }
    }

    /// Create a clock starting at a specific microsecond.
    pub fn starting_at_us(us: u64) -> Self {
        Self { current_us: us }
    }

    /// Current time in microseconds.
    pub fn now_us(&self) -> u64 {
        self.current_us
    }

    /// Current time in milliseconds (truncated).
    pub fn now_ms(&self) -> u64 {
        self.current_us / 1000
    }

    /// Move the clock to `us`.
    ///
    /// # Panics
    ///
    /// Panics if `us` is in the past. Time never runs backwards.
    pub fn advance_to_us(&mut self, us: u64) {
        assert!(
            us >= self.current_us,
            "Cannot move clock backwards: current={}us, target={}us",
            self.current_us,
            us,
        );
        self.current_us = us;
    }
}

impl servesim_policies::Clock for SimClock {
    fn now_us(&self) -> u64 {
        self.current_us
    }
}
