/// Exponential backoff for forced teardown.
///
/// A unit caught mid-create or mid-start cannot always be killed or removed
/// on the first try (the engine answers "not found" or "conflict" until it
/// settles). Teardown retries on this schedule instead of leaking the unit.
use std::time::Duration;

/// First retry delay.
const TEARDOWN_INITIAL_DELAY: Duration = Duration::from_millis(50);

/// Cap on a single retry delay.
const TEARDOWN_MAX_DELAY: Duration = Duration::from_millis(400);

/// Teardown attempts before giving up on a unit.
const TEARDOWN_MAX_ATTEMPTS: u32 = 6;

pub struct Backoff {
    max_delay: Duration,
    multiplier: u32,
    max_attempts: u32,
    current_delay: Duration,
    /// Number of delays handed out so far.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            max_delay,
            multiplier,
            max_attempts,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Schedule used by forced teardown: 50, 100, 200, 400, 400 ms.
    pub fn for_teardown() -> Self {
        Self::new(
            TEARDOWN_INITIAL_DELAY,
            TEARDOWN_MAX_DELAY,
            2,
            TEARDOWN_MAX_ATTEMPTS,
        )
    }

    /// Returns the current delay and advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * self.multiplier).min(self.max_delay);
        delay
    }

    /// True once the attempt that follows the last delay has been made,
    /// i.e. `max_attempts` tries including the first one.
    pub fn exhausted(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }

    /// Sum of every delay the schedule can still hand out.
    pub fn remaining_budget(&self) -> Duration {
        let mut probe = Self {
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
            current_delay: self.current_delay,
            attempt: self.attempt,
        };
        let mut total = Duration::ZERO;
        while !probe.exhausted() {
            total += probe.next_delay();
        }
        total
    }
}
