// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Non-recursive mutual-exclusion lock: an owner slot plus a wait queue,
//! both behind one spinlock.

use abi::{KernError, SignalSet, WaitFlags, WakeReason};

use crate::fail;
use crate::sched::Scheduler;
use crate::spinlock::Spinlock;
use crate::vcpu::VcpuId;
use crate::waitqueue::{self, WaitQueue};

struct State {
    owner: Option<VcpuId>,
    waiters: WaitQueue,
}

/// A mutex is not recursive: the owner calling `lock` again deadlocks (or,
/// with the `deadlock-check` feature, dies with a diagnostic instead of
/// hanging). Unlocking from a vcpu that doesn't hold the mutex is always
/// fatal, never a returned error.
pub struct Mutex {
    state: Spinlock<State>,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            state: Spinlock::new(State {
                owner: None,
                waiters: WaitQueue::new(),
            }),
        }
    }

    /// Tears down the mutex. Fatal by policy if a waiter remains; the
    /// caller must drain or wake them first.
    pub fn deinit(&mut self) -> Result<(), KernError> {
        self.state.lock().waiters.deinit()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Non-blocking: succeeds only if the mutex is currently free.
    pub fn try_lock(&self, sched: &Scheduler) -> Result<(), KernError> {
        let mut g = self.state.lock();
        if g.owner.is_some() {
            return Err(KernError::Busy);
        }
        g.owner = Some(sched.current_id());
        Ok(())
    }

    /// Blocks until the mutex is acquired.
    pub fn lock(&self, sched: &mut Scheduler) {
        loop {
            let id = sched.current_id();
            let mut g = self.state.lock();

            #[cfg(feature = "deadlock-check")]
            if g.owner == Some(id) {
                drop(g);
                fail::die("mutex: lock() called by the vcpu that already holds it");
            }

            if g.owner.is_none() {
                g.owner = Some(id);
                return;
            }

            // Enqueue while still holding our own spinlock: that keeps the
            // quantum tick from slipping a context switch to the owner's
            // `unlock` in between "found contended" and "enqueued", which
            // would otherwise risk a lost wakeup. The reschedule itself runs
            // only after the lock (and the preemption it disables) is
            // released.
            let prepared = waitqueue::prepare_wait(sched, &mut g.waiters, SignalSet::UNBLOCKABLE);
            drop(g);
            match prepared {
                Err(_interrupted) => continue,
                Ok(()) => {
                    waitqueue::finish_wait(sched, id);
                }
            }
        }
    }

    /// Releases the mutex. Wakes at most one waiter, which then competes for
    /// the lock like any other caller of `lock` rather than receiving direct
    /// ownership handoff.
    ///
    /// # Panics (fatally)
    ///
    /// If the caller does not currently hold the mutex.
    pub fn unlock(&self, sched: &mut Scheduler) {
        let id = sched.current_id();
        let mut g = self.state.lock();
        if g.owner != Some(id) {
            drop(g);
            fail::die("mutex: unlock() called by a vcpu that does not hold it");
        }
        g.owner = None;
        let woke_higher = waitqueue::wake_no_switch(
            sched,
            &mut g.waiters,
            WaitFlags::WAKE_ONE,
            WakeReason::Wakeup,
        );
        drop(g);
        if woke_higher {
            sched.yield_now();
        }
    }

    /// Unlocks this mutex and blocks the caller on `cv_waiters` until woken
    /// or `timeout` elapses, reacquiring nothing before returning (the
    /// caller, [`crate::sync::condvar::Condvar::wait`], reacquires the
    /// mutex itself once this returns).
    ///
    /// Both the unlock and the enqueue happen while this mutex's own
    /// spinlock is held, which is what makes the handoff atomic: a
    /// `signal`/`broadcast` also has to lock this same mutex first (see
    /// [`Mutex::wake_associated`]), so it can never run between our unlock
    /// and our enqueue.
    pub(crate) fn unlock_and_wait(
        &self,
        sched: &mut Scheduler,
        clock: &crate::clock::Clock,
        cv_waiters: &mut WaitQueue,
        timeout: abi::Timespec,
    ) -> abi::WaitOutcome {
        let id = sched.current_id();
        let mut g = self.state.lock();
        if g.owner != Some(id) {
            drop(g);
            fail::die("condvar: wait() called without holding the associated mutex");
        }
        g.owner = None;
        waitqueue::wake_no_switch(
            sched,
            &mut g.waiters,
            WaitFlags::WAKE_ONE,
            WakeReason::Wakeup,
        );
        let prepared = waitqueue::prepare_timedwait(
            sched,
            clock,
            cv_waiters,
            SignalSet::UNBLOCKABLE,
            WaitFlags::empty(),
            timeout,
        );
        drop(g);
        match prepared {
            Err(outcome) => outcome,
            Ok(deadline) => waitqueue::finish_timedwait(sched, clock, id, deadline).0,
        }
    }

    /// Wakes waiters on `cv_waiters` under this mutex's own spinlock.
    /// Requires the caller to already hold the mutex, matching the
    /// conventional condvar discipline.
    pub(crate) fn wake_associated(
        &self,
        sched: &mut Scheduler,
        cv_waiters: &mut WaitQueue,
        flags: WaitFlags,
    ) {
        let id = sched.current_id();
        let mut g = self.state.lock();
        if g.owner != Some(id) {
            drop(g);
            fail::die("condvar: signal/broadcast called without holding the associated mutex");
        }
        waitqueue::wake_no_switch(sched, cv_waiters, flags, WakeReason::Wakeup);
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{Priority, QosClass};

    fn prio() -> Priority {
        Priority::new(QosClass::Utility, 0)
    }

    #[test]
    fn try_lock_then_unlock_round_trip() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mx = Mutex::new();
        assert!(!mx.is_locked());
        mx.try_lock(&sched).unwrap();
        assert!(mx.is_locked());
        assert_eq!(mx.try_lock(&sched), Err(KernError::Busy));
        mx.unlock(&mut sched);
        assert!(!mx.is_locked());
    }

    #[test]
    fn lock_uncontended_succeeds_immediately() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mx = Mutex::new();
        mx.lock(&mut sched);
        assert!(mx.is_locked());
    }

    #[test]
    #[should_panic(expected = "does not hold it")]
    fn unlock_by_non_owner_is_fatal() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mx = Mutex::new();
        mx.try_lock(&sched).unwrap();

        let other = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(other);
        mx.unlock(&mut sched);
    }

    #[test]
    fn deinit_fails_while_a_waiter_is_queued() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mut mx = Mutex::new();
        mx.try_lock(&sched).unwrap();
        let a = sched.acquire(prio()).unwrap();
        sched.suspend(a);
        sched
            .table_mut()
            .get_mut(a)
            .set_wait_link(crate::vcpu::WaitLink::default());
        {
            let mut g = mx.state.lock();
            g.waiters.push_for_test(sched.table_mut(), a);
        }
        assert_eq!(mx.deinit(), Err(KernError::Invalid));
    }
}
