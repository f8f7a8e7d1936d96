// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Condition variable: just a wait queue, with no spinlock of its own.
//!
//! Every operation on a condvar requires the caller to already hold the
//! associated mutex, so the mutex's own spinlock is what protects `waiters`
//! here. `wait` unlocks the mutex and enqueues the caller on this queue
//! atomically ([`crate::sync::mutex::Mutex::unlock_and_wait`]) to close the
//! lost-wakeup window between releasing the mutex and blocking.

use abi::{KernError, Timespec, WaitFlags, WaitOutcome};

use crate::clock::Clock;
use crate::sched::Scheduler;
use crate::sync::mutex::Mutex;
use crate::waitqueue::WaitQueue;

pub struct Condvar {
    waiters: WaitQueue,
}

impl Condvar {
    pub const fn new() -> Self {
        Condvar {
            waiters: WaitQueue::new(),
        }
    }

    pub fn deinit(&mut self) -> Result<(), KernError> {
        self.waiters.deinit()
    }

    /// Atomically unlocks `mx` and blocks the caller on this condvar,
    /// reacquiring `mx` before returning. `mx` must be held by the caller.
    pub fn wait(&mut self, sched: &mut Scheduler, clock: &Clock, mx: &Mutex) {
        let _ = mx.unlock_and_wait(sched, clock, &mut self.waiters, Timespec::INF);
        mx.lock(sched);
    }

    /// As [`Condvar::wait`], bounded by `timeout`. The mutex is reacquired
    /// before returning even on a timeout.
    pub fn wait_timeout(
        &mut self,
        sched: &mut Scheduler,
        clock: &Clock,
        mx: &Mutex,
        timeout: Timespec,
    ) -> WaitOutcome {
        let outcome = mx.unlock_and_wait(sched, clock, &mut self.waiters, timeout);
        mx.lock(sched);
        outcome
    }

    /// Wakes one waiter. `mx` must be the mutex every current waiter was
    /// blocked under, and the caller must hold it.
    pub fn signal(&mut self, sched: &mut Scheduler, mx: &Mutex) {
        mx.wake_associated(sched, &mut self.waiters, WaitFlags::WAKE_ONE);
    }

    /// Wakes every waiter.
    pub fn broadcast(&mut self, sched: &mut Scheduler, mx: &Mutex) {
        mx.wake_associated(sched, &mut self.waiters, WaitFlags::WAKE_ALL);
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{Priority, QosClass, WakeReason};

    fn prio() -> Priority {
        Priority::new(QosClass::Utility, 0)
    }

    #[test]
    fn signal_wakes_head_of_queue_waiter() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mx = Mutex::new();
        let mut cv = Condvar::new();
        mx.try_lock(&sched).unwrap();

        // We can't literally block a second vcpu on the condvar from this
        // one call stack, so drive the queue directly: enqueue `a` as if
        // it had called `wait` and released the mutex, then confirm
        // `signal` wakes it.
        let a = sched.acquire(prio()).unwrap();
        sched.suspend(a);
        sched
            .table_mut()
            .get_mut(a)
            .set_wait_link(crate::vcpu::WaitLink::default());
        cv.waiters.push_for_test(sched.table_mut(), a);

        cv.signal(&mut sched, &mx);
        assert_eq!(
            sched.table().get(a).wait_link().reason,
            Some(WakeReason::Wakeup)
        );
        assert!(cv.waiters.is_empty());
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mx = Mutex::new();
        let mut cv = Condvar::new();
        mx.try_lock(&sched).unwrap();

        let a = sched.acquire(prio()).unwrap();
        let b = sched.acquire(prio()).unwrap();
        sched.suspend(a);
        sched.suspend(b);
        sched
            .table_mut()
            .get_mut(a)
            .set_wait_link(crate::vcpu::WaitLink::default());
        sched
            .table_mut()
            .get_mut(b)
            .set_wait_link(crate::vcpu::WaitLink::default());
        cv.waiters.push_for_test(sched.table_mut(), a);
        cv.waiters.push_for_test(sched.table_mut(), b);

        cv.broadcast(&mut sched, &mx);
        assert!(cv.waiters.is_empty());
        assert_eq!(
            sched.table().get(a).wait_link().reason,
            Some(WakeReason::Wakeup)
        );
        assert_eq!(
            sched.table().get(b).wait_link().reason,
            Some(WakeReason::Wakeup)
        );
    }

    #[test]
    #[should_panic(expected = "without holding the associated mutex")]
    fn signal_without_holding_mutex_is_fatal() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mx = Mutex::new();
        let mut cv = Condvar::new();
        cv.signal(&mut sched, &mx);
    }

    #[test]
    fn deinit_fails_while_a_waiter_is_queued() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mut cv = Condvar::new();
        let a = sched.acquire(prio()).unwrap();
        sched.suspend(a);
        cv.waiters.push_for_test(sched.table_mut(), a);
        assert_eq!(cv.deinit(), Err(KernError::Invalid));
    }
}
