// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Leaf spinlock guarding short state-transition critical sections.
//!
//! There is exactly one CPU, so the lock body never actually contends with
//! another core: its job is to mask interrupts for the duration of the
//! critical section, so an interrupt handler can't reenter the same data
//! structure mid-update. The atomic flag is kept anyway so a second core,
//! should one ever appear, would just work, and so double-lock bugs panic
//! instead of deadlocking silently against ourselves.
//!
//! Every spinlock in this kernel is a leaf lock: the concurrency model
//! forbids nesting one spinlock inside another (heap-inside-IRQ is
//! explicitly forbidden).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::fail;
use crate::preempt;

pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Disables preemption, then acquires the lock, returning a guard that
    /// releases the lock and restores preemption on drop.
    ///
    /// Reentrant locking (the current holder calling `lock` again before
    /// releasing) would spin forever; since we're uniprocessor, this only
    /// happens as a kernel bug, and we'd rather fail loudly than hang. A
    /// bounded retry count turns that hang into a fatal diagnostic.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let token = preempt::disable();
        const MAX_SPINS: u32 = 1_000_000;
        let mut spins = 0;
        while self
            .locked
            .compare_exchange_weak(
                false,
                true,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            spins += 1;
            if spins > MAX_SPINS {
                fail::die("spinlock: held too long, likely self-deadlock");
            }
            core::hint::spin_loop();
        }
        SpinlockGuard {
            lock: self,
            token: Some(token),
        }
    }

    /// Non-blocking variant of [`Spinlock::lock`]. Returns `None` if the
    /// lock is currently held.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        let token = preempt::disable();
        if self
            .locked
            .compare_exchange(
                false,
                true,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(SpinlockGuard {
                lock: self,
                token: Some(token),
            })
        } else {
            preempt::restore(token);
            None
        }
    }
}

pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    token: Option<preempt::Token>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if let Some(token) = self.token.take() {
            preempt::restore(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_mutual_exclusion() {
        let lock = Spinlock::new(0u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn lock_masks_and_restores_preemption() {
        assert!(!preempt::is_disabled());
        let lock = Spinlock::new(());
        {
            let _g = lock.lock();
            assert!(preempt::is_disabled());
        }
        assert!(!preempt::is_disabled());
    }
}
