// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The monotonic clock: a free-running tick counter advanced by the
//! periodic quantum timer, plus conversions between it and wall-clock time.
//!
//! Only one clock identity exists in this core (`MONOTONIC`); higher layers
//! may multiplex wall-clock translations on top of it.

use abi::{Quantum, Rounding, Timespec};

use crate::config::{MAX_SHORT_DELAY_NS, NS_PER_QUANTUM};
use crate::fail;
use crate::spinlock::Spinlock;

struct State {
    current_time: Timespec,
    current_quantum: Quantum,
}

/// The monotonic clock. One instance is the kernel's time base; tests
/// construct their own to simulate ticks without touching any global state.
pub struct Clock {
    state: Spinlock<State>,
    ns_per_quantum: u32,
}

impl Clock {
    pub const fn new(ns_per_quantum: u32) -> Self {
        Clock {
            state: Spinlock::new(State {
                current_time: Timespec::ZERO,
                current_quantum: Quantum::ZERO,
            }),
            ns_per_quantum,
        }
    }

    /// Advances the clock by one quantum. Called from the quantum timer
    /// interrupt; nothing else should call this.
    pub fn on_tick(&self) {
        let mut s = self.state.lock();
        s.current_quantum = s.current_quantum.saturating_add(1);
        s.current_time = s
            .current_time
            .add(Timespec::from_ns(i64::from(self.ns_per_quantum)));
    }

    /// Returns a coherent `(time, quantum)` snapshot. Briefly locks the
    /// clock's internal spinlock, which masks interrupts, so the timer ISR
    /// can't observe or produce a torn read.
    pub fn gettime(&self) -> Timespec {
        self.state.lock().current_time
    }

    /// Current tick count.
    pub fn now_quantum(&self) -> Quantum {
        self.state.lock().current_quantum
    }

    /// Hard-spins for approximately `ns` nanoseconds. Only valid for
    /// `ns < MAX_SHORT_DELAY_NS`; longer waits must go through a wait queue
    /// instead. Exceeding the ceiling is a caller bug, not a recoverable
    /// condition.
    pub fn delay(&self, ns: u32) {
        if ns > MAX_SHORT_DELAY_NS {
            fail::die("clock::delay exceeds MAX_SHORT_DELAY_NS");
        }
        crate::arch::hard_spin(ns);
    }

    /// Converts a timespec to a quantum count, exact for multiples of
    /// `ns_per_quantum` and rounded otherwise per `rounding`. Saturates at
    /// `u32::MAX`.
    pub fn time2quantums(&self, ts: Timespec, rounding: Rounding) -> Quantum {
        let ns = ts.as_ns().max(0) as u128;
        let per = u128::from(self.ns_per_quantum);
        let whole = ns / per;
        let rem = ns % per;
        let q = if rem == 0 {
            whole
        } else {
            match rounding {
                Rounding::TowardZero => whole,
                Rounding::AwayFromZero => whole + 1,
            }
        };
        Quantum(q.min(u128::from(u32::MAX)) as u32)
    }

    /// Converts a quantum count to its exact timespec.
    pub fn quantums2time(&self, q: Quantum) -> Timespec {
        Timespec::from_ns(i64::from(u32::from(q)) * i64::from(self.ns_per_quantum))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new(NS_PER_QUANTUM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_advances_time_and_quantum() {
        let clock = Clock::new(1_000_000);
        clock.on_tick();
        clock.on_tick();
        assert_eq!(clock.now_quantum(), Quantum(2));
        assert_eq!(clock.gettime(), Timespec::from_ns(2_000_000));
    }

    #[test]
    fn exact_conversion_roundtrips() {
        let clock = Clock::new(1_000_000);
        let ts = Timespec::from_ns(5_000_000);
        let q = clock.time2quantums(ts, Rounding::TowardZero);
        assert_eq!(q, Quantum(5));
        assert_eq!(clock.quantums2time(q), ts);
    }

    #[test]
    fn inexact_conversion_rounds_per_mode() {
        let clock = Clock::new(1_000_000);
        let ts = Timespec::from_ns(5_400_000);
        assert_eq!(clock.time2quantums(ts, Rounding::TowardZero), Quantum(5));
        assert_eq!(clock.time2quantums(ts, Rounding::AwayFromZero), Quantum(6));
    }

    #[test]
    fn delay_within_ceiling_spins() {
        let clock = Clock::new(1_000_000);
        clock.delay(500);
        assert!(crate::arch::spun_ns_total() >= 500);
    }

    #[test]
    #[should_panic(expected = "MAX_SHORT_DELAY_NS")]
    fn delay_beyond_ceiling_is_fatal() {
        let clock = Clock::new(1_000_000);
        clock.delay(MAX_SHORT_DELAY_NS + 1);
    }
}
