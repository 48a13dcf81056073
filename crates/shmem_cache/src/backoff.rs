// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Exponential backoff for busy-wait loops over shared memory.
//!
//! Peers in other processes cannot wake us, so every wait in the crate is a poll. Short waits
//! spin, medium waits yield the processor, and long waits sleep with exponentially growing,
//! capped delays so that a stalled peer does not burn a whole core.

use std::time::Duration;

/// Steps `0..=SPIN_LIMIT` busy-spin for `2^step` iterations.
const SPIN_LIMIT: u32 = 6;

/// Steps up to this limit yield the time slice instead of spinning.
const YIELD_LIMIT: u32 = 10;

/// Upper bound for a single sleep once yielding is no longer enough.
const MAX_SLEEP: Duration = Duration::from_micros(500);

#[derive(Debug, Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) const fn new() -> Self {
        Self { step: 0 }
    }

    /// Waits a little, longer on every call.
    pub(crate) fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1_u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step <= YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(sleep_for(self.step - YIELD_LIMIT));
        }

        self.step = self.step.saturating_add(1);
    }
}

fn sleep_for(exponent: u32) -> Duration {
    let micros = 1_u64.checked_shl(exponent).unwrap_or(u64::MAX);
    Duration::from_micros(micros).min(MAX_SLEEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_from_spinning_to_sleeping() {
        let mut backoff = Backoff::new();
        for _ in 0..=YIELD_LIMIT {
            assert!(backoff.step <= YIELD_LIMIT);
            backoff.snooze();
        }

        // The next snooze sleeps.
        assert!(backoff.step > YIELD_LIMIT);
    }

    #[test]
    fn sleep_is_capped() {
        assert_eq!(sleep_for(1), Duration::from_micros(2));
        assert_eq!(sleep_for(30), MAX_SLEEP);
        assert_eq!(sleep_for(200), MAX_SLEEP);
    }

    #[test]
    fn step_saturates() {
        let mut backoff = Backoff { step: u32::MAX - 1 };
        backoff.snooze();
        backoff.snooze();
        assert_eq!(backoff.step, u32::MAX);
    }
}
