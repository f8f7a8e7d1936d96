// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphore: a permit count plus a wait queue, both behind one
//! spinlock. `permits` never goes negative; whenever it's positive the wait
//! queue is empty.

use abi::{KernError, SignalSet, Timespec, WaitFlags, WaitOutcome, WakeReason};

use crate::clock::Clock;
use crate::sched::Scheduler;
use crate::spinlock::Spinlock;
use crate::waitqueue::{self, WaitQueue};

struct State {
    permits: u32,
    waiters: WaitQueue,
}

pub struct Semaphore {
    state: Spinlock<State>,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Semaphore {
            state: Spinlock::new(State {
                permits: initial,
                waiters: WaitQueue::new(),
            }),
        }
    }

    pub fn deinit(&mut self) -> Result<(), KernError> {
        self.state.lock().waiters.deinit()
    }

    pub fn permits(&self) -> u32 {
        self.state.lock().permits
    }

    pub fn try_acquire(&self, n: u32) -> Result<(), KernError> {
        let mut g = self.state.lock();
        if g.permits >= n {
            g.permits -= n;
            Ok(())
        } else {
            Err(KernError::Busy)
        }
    }

    /// Takes every permit currently available without blocking, even if
    /// that's zero.
    pub fn try_acquire_all(&self) -> u32 {
        let mut g = self.state.lock();
        let taken = g.permits;
        g.permits = 0;
        taken
    }

    /// Blocks until `n` permits are available, then takes them.
    pub fn acquire(&self, sched: &mut Scheduler, n: u32) -> WakeReason {
        loop {
            let id = sched.current_id();
            let mut g = self.state.lock();
            if g.permits >= n {
                g.permits -= n;
                return WakeReason::Wakeup;
            }
            let prepared =
                waitqueue::prepare_wait(sched, &mut g.waiters, SignalSet::UNBLOCKABLE);
            drop(g);
            match prepared {
                Err(reason) => return reason,
                Ok(()) => {
                    if waitqueue::finish_wait(sched, id) == WakeReason::Interrupted {
                        return WakeReason::Interrupted;
                    }
                    // Woke on a Wakeup reason but another acquirer may have
                    // taken the permits first; loop back and recheck.
                }
            }
        }
    }

    /// As [`Semaphore::acquire`], bounded by a deadline relative to `clock`'s
    /// current time unless `flags` carries `WAIT_ABSTIME`.
    pub fn acquire_timeout(
        &self,
        sched: &mut Scheduler,
        clock: &Clock,
        n: u32,
        flags: WaitFlags,
        wtp: Timespec,
    ) -> WaitOutcome {
        let now = clock.gettime();
        let deadline = if flags.contains(WaitFlags::WAIT_ABSTIME) {
            wtp
        } else {
            now.add(wtp)
        };
        loop {
            let id = sched.current_id();
            let mut g = self.state.lock();
            if g.permits >= n {
                g.permits -= n;
                return WaitOutcome::Woken(WakeReason::Wakeup);
            }
            let prepared = waitqueue::prepare_timedwait(
                sched,
                clock,
                &mut g.waiters,
                SignalSet::UNBLOCKABLE,
                WaitFlags::WAIT_ABSTIME,
                deadline,
            );
            drop(g);
            match prepared {
                Err(outcome) => return outcome,
                Ok(deadline) => {
                    let (outcome, _) = waitqueue::finish_timedwait(sched, clock, id, deadline);
                    match outcome {
                        WaitOutcome::Woken(WakeReason::Wakeup) => continue,
                        other => return other,
                    }
                }
            }
        }
    }

    /// Blocks until at least one permit is available, then atomically takes
    /// every permit currently available and reports how many.
    pub fn acquire_all(
        &self,
        sched: &mut Scheduler,
        clock: &Clock,
        timeout: Timespec,
    ) -> Result<u32, KernError> {
        let deadline = clock.gettime().add(timeout);
        loop {
            let id = sched.current_id();
            let mut g = self.state.lock();
            if g.permits > 0 {
                let taken = g.permits;
                g.permits = 0;
                return Ok(taken);
            }
            let prepared = waitqueue::prepare_timedwait(
                sched,
                clock,
                &mut g.waiters,
                SignalSet::UNBLOCKABLE,
                WaitFlags::WAIT_ABSTIME,
                deadline,
            );
            drop(g);
            match prepared {
                Err(outcome) => return outcome.into_result().map(|_| 0),
                Ok(deadline) => {
                    let (outcome, _) = waitqueue::finish_timedwait(sched, clock, id, deadline);
                    match outcome {
                        WaitOutcome::Woken(WakeReason::Wakeup) => continue,
                        other => return other.into_result().map(|_| 0),
                    }
                }
            }
        }
    }

    /// Adds `n` permits and wakes as many head-of-queue waiters as can now
    /// plausibly proceed.
    pub fn relinquish(&self, sched: &mut Scheduler, n: u32) {
        let mut g = self.state.lock();
        g.permits += n;
        let limit = g.permits as usize;
        let woke_higher =
            waitqueue::wake_up_to_no_switch(sched, &mut g.waiters, limit, WakeReason::Wakeup);
        drop(g);
        if woke_higher {
            sched.yield_now();
        }
    }

    /// IRQ-safe variant of [`Semaphore::relinquish`]: adds permits and marks
    /// waiters ready, but never switches context itself, since an interrupt
    /// handler must not block or reschedule. The actual hand-off to a
    /// newly-ready waiter happens at the next preemption-enabled scheduling
    /// point (a voluntary yield or the next quantum tick).
    pub fn relinquish_irq(&self, sched: &mut Scheduler, n: u32) {
        let mut g = self.state.lock();
        g.permits += n;
        let limit = g.permits as usize;
        waitqueue::wake_up_to_no_switch(sched, &mut g.waiters, limit, WakeReason::Wakeup);
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
    fn try_acquire_respects_permit_count() {
        let sem = Semaphore::new(2);
        sem.try_acquire(2).unwrap();
        assert_eq!(sem.try_acquire(1), Err(KernError::Busy));
        assert_eq!(sem.permits(), 0);
    }

    #[test]
    fn acquire_uncontended_succeeds_immediately() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let sem = Semaphore::new(3);
        assert_eq!(sem.acquire(&mut sched, 3), WakeReason::Wakeup);
        assert_eq!(sem.permits(), 0);
    }

    #[test]
    fn try_acquire_all_drains_whatever_is_available() {
        let sem = Semaphore::new(5);
        assert_eq!(sem.try_acquire_all(), 5);
        assert_eq!(sem.try_acquire_all(), 0);
    }

    #[test]
    fn relinquish_wakes_bounded_by_new_permit_count() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let sem = Semaphore::new(0);
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
        {
            let mut g = sem.state.lock();
            g.waiters.push_for_test(sched.table_mut(), a);
            g.waiters.push_for_test(sched.table_mut(), b);
        }

        sem.relinquish(&mut sched, 1);
        assert_eq!(
            sched.table().get(a).wait_link().reason,
            Some(WakeReason::Wakeup)
        );
        assert_eq!(sched.table().get(b).wait_link().reason, None);
    }

    #[test]
    fn acquire_timeout_past_deadline_times_out() {
        let clock = Clock::new(1_000_000);
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let sem = Semaphore::new(0);
        let outcome =
            sem.acquire_timeout(&mut sched, &clock, 1, WaitFlags::empty(), Timespec::ZERO);
        assert_eq!(outcome, WaitOutcome::Timeout);
    }
}
