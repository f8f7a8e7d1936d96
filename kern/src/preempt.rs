// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Preemption-disable nesting counter.
//!
//! A nonzero count inhibits context switches; `disable` nests, `restore`
//! unwinds exactly one level. The counter and the raw interrupt mask are
//! kept together because the first `disable` at depth 0 is the one that
//! actually masks the hardware, and the last matching `restore` is the one
//! that unmasks it.

use crate::arch;
use crate::fail;

// There's exactly one CPU, so the nesting counter is genuinely global state
// on real hardware (`depth_cell`'s `not(test)` arm). Under `cfg(test)`,
// `cargo test`'s thread-per-test harness would otherwise let unrelated tests
// race on a shared counter, so the simulator keeps the counter
// thread-local instead; each test thread gets its own, independent "CPU".
#[cfg(not(test))]
mod counter {
    use core::sync::atomic::{AtomicU32, Ordering};

    static DEPTH: AtomicU32 = AtomicU32::new(0);

    pub(super) fn fetch_add() -> u32 {
        DEPTH.fetch_add(1, Ordering::Acquire)
    }

    pub(super) fn fetch_sub() -> u32 {
        DEPTH.fetch_sub(1, Ordering::Release)
    }

    pub(super) fn load() -> u32 {
        DEPTH.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod counter {
    use core::cell::Cell;

    std::thread_local! {
        static DEPTH: Cell<u32> = const { Cell::new(0) };
    }

    pub(super) fn fetch_add() -> u32 {
        DEPTH.with(|d| {
            let v = d.get();
            d.set(v + 1);
            v
        })
    }

    pub(super) fn fetch_sub() -> u32 {
        DEPTH.with(|d| {
            let v = d.get();
            d.set(v.wrapping_sub(1));
            v
        })
    }

    pub(super) fn load() -> u32 {
        DEPTH.with(Cell::get)
    }
}

/// Token returned by [`disable`]; must be passed to exactly one matching
/// [`restore`] call, in strict LIFO order with any other outstanding tokens.
#[must_use]
#[derive(Debug)]
pub struct Token {
    mask: Option<arch::RawIrqMask>,
}

/// Increments the nesting counter, masking interrupts on the transition from
/// 0 to 1.
pub fn disable() -> Token {
    let depth = counter::fetch_add();
    let mask = if depth == 0 {
        Some(arch::raw_mask_disable_all())
    } else {
        None
    };
    Token { mask }
}

/// Decrements the nesting counter, restoring the saved interrupt mask on the
/// transition from 1 to 0.
///
/// Calling this more times than `disable` was called is a preemption-disable
/// underflow: a fatal kernel bug.
pub fn restore(token: Token) {
    let prev = counter::fetch_sub();
    if prev == 0 {
        fail::die("preempt::restore called without a matching disable");
    }
    if let Some(mask) = token.mask {
        arch::raw_mask_restore(mask);
    }
}

/// Whether preemption is currently disabled at any depth.
pub fn is_disabled() -> bool {
    counter::load() != 0
}

/// Current nesting depth.
pub fn depth() -> u32 {
    counter::load()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nests_and_unwinds() {
        assert_eq!(depth(), 0);
        let a = disable();
        assert_eq!(depth(), 1);
        let b = disable();
        assert_eq!(depth(), 2);
        restore(b);
        assert_eq!(depth(), 1);
        restore(a);
        assert_eq!(depth(), 0);
        assert!(!is_disabled());
    }
}
