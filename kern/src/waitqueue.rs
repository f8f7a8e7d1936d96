// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The wait queue: the single rendezvous primitive every higher-level
//! blocking facility (mutex, semaphore, condvar) is built on top of.
//!
//! A queue owns no vcpus, only FIFO linkage through [`crate::intrusive`]; the
//! per-waiter wakeup reason, deadline, and signal mask live on the vcpu's own
//! [`crate::vcpu::WaitLink`] and are read back once the waiter is current
//! again.
//!
//! Signal delivery here covers the synchronous case (a signal already
//! pending when a wait begins aborts it immediately) and the case where the
//! caller knows which queue a target vcpu is parked on ([`deliver_signal`]).
//! Asynchronously finding "whichever queue some other vcpu happens to be
//! blocked on" would need a process-wide vcpu→queue registry; that belongs
//! to the out-of-scope process/signal layer built on top of this primitive,
//! not to the wait queue itself.

use abi::{
    KernError, SignalSet, Timespec, VcpuSchedState, WaitFlags, WaitOutcome, WakeReason,
};

use crate::clock::Clock;
use crate::config::MAX_VCPUS;
use crate::fail;
use crate::intrusive::IntrusiveQueue;
use crate::preempt;
use crate::sched::Scheduler;
use crate::vcpu::{VcpuId, WaitLink};

/// A FIFO of blocked vcpus. Caller-owned: `init`/`deinit`-style lifecycle,
/// `deinit` fails on a non-empty queue rather than silently abandoning
/// waiters.
#[derive(Default)]
pub struct WaitQueue {
    queue: IntrusiveQueue,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue {
            queue: IntrusiveQueue::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Tears down the queue. Returns [`KernError::Invalid`] if any waiter
    /// remains; the caller must drain or wake them first.
    pub fn deinit(&mut self) -> Result<(), KernError> {
        if self.queue.is_empty() {
            Ok(())
        } else {
            Err(KernError::Invalid)
        }
    }
}

/// Returns the lowest signal bit in `pending` that this waiter would be
/// interrupted by, given `mask` (signals it wants to remain unblocked).
fn interrupting_bit(pending: u32, mask: SignalSet) -> Option<u32> {
    let relevant = pending & (mask.0 | SignalSet::UNBLOCKABLE);
    if relevant == 0 {
        None
    } else {
        Some(relevant & relevant.wrapping_neg())
    }
}

fn check_preempt_depth() {
    if preempt::depth() > 1 {
        fail::die("wait: preemption disabled deeper than one level");
    }
}

/// Blocks the current vcpu on `q` until woken. If a signal in `mask` (or the
/// unblockable signal) is already pending, returns `Interrupted` without
/// blocking.
pub fn wait(sched: &mut Scheduler, q: &mut WaitQueue, mask: SignalSet) -> WakeReason {
    let id = sched.current_id();
    match prepare_wait(sched, q, mask) {
        Err(reason) => reason,
        Ok(()) => finish_wait(sched, id),
    }
}

/// The "decide to block" half of [`wait`], split out so a synchronization
/// primitive (mutex, semaphore, condvar) can run it while still holding its
/// own state spinlock. That matters on this uniprocessor design: holding
/// that spinlock (which disables preemption) across the check-state and
/// enqueue steps is what rules out the quantum timer sneaking in a context
/// switch between "found contended" and "enqueued", which would otherwise
/// risk a lost wakeup. The actual reschedule, in [`finish_wait`], must
/// happen only after that spinlock is released: context switches occur only
/// with preemption enabled at the outermost level.
///
/// Returns `Err(reason)` if an already-pending signal resolves the wait
/// without blocking; the caller must not call [`finish_wait`] in that case.
pub fn prepare_wait(
    sched: &mut Scheduler,
    q: &mut WaitQueue,
    mask: SignalSet,
) -> Result<(), WakeReason> {
    let id = sched.current_id();
    let pending = sched.table().get(id).pending_signals().0;
    if let Some(bit) = interrupting_bit(pending, mask) {
        sched.table_mut().get_mut(id).clear_signal(bit);
        return Err(WakeReason::Interrupted);
    }
    block_on(sched, q, id, mask, None);
    Ok(())
}

/// The "actually switch away" half of [`wait`]. `id` must be the id
/// [`prepare_wait`] was called for.
pub fn finish_wait(sched: &mut Scheduler, id: VcpuId) -> WakeReason {
    check_preempt_depth();
    sched.resched();
    take_wake_reason(sched, id).expect("woken vcpu must carry a wake reason")
}

/// As [`wait`], but also bounds the block with a deadline. `flags` selects
/// absolute vs. relative interpretation of `wtp`. Returns the unslept
/// remainder alongside the outcome; the remainder is only meaningful on a
/// non-timeout wakeup.
pub fn timedwait(
    sched: &mut Scheduler,
    clock: &Clock,
    q: &mut WaitQueue,
    mask: SignalSet,
    flags: WaitFlags,
    wtp: Timespec,
) -> (WaitOutcome, Timespec) {
    let id = sched.current_id();
    match prepare_timedwait(sched, clock, q, mask, flags, wtp) {
        Err(outcome) => (outcome, Timespec::ZERO),
        Ok(deadline) => finish_timedwait(sched, clock, id, deadline),
    }
}

/// The "decide to block" half of [`timedwait`]; see [`prepare_wait`] for why
/// a sync primitive should call this (and [`finish_timedwait`]) directly
/// instead of [`timedwait`]. Returns the computed absolute deadline on
/// success.
pub fn prepare_timedwait(
    sched: &mut Scheduler,
    clock: &Clock,
    q: &mut WaitQueue,
    mask: SignalSet,
    flags: WaitFlags,
    wtp: Timespec,
) -> Result<Timespec, WaitOutcome> {
    let id = sched.current_id();
    let pending = sched.table().get(id).pending_signals().0;
    if let Some(bit) = interrupting_bit(pending, mask) {
        sched.table_mut().get_mut(id).clear_signal(bit);
        return Err(WaitOutcome::Woken(WakeReason::Interrupted));
    }

    let now = clock.gettime();
    let deadline = if flags.contains(WaitFlags::WAIT_ABSTIME) {
        wtp
    } else {
        now.add(wtp)
    };
    if deadline <= now {
        return Err(WaitOutcome::Timeout);
    }

    block_on(sched, q, id, mask, Some(deadline));
    Ok(deadline)
}

pub fn finish_timedwait(
    sched: &mut Scheduler,
    clock: &Clock,
    id: VcpuId,
    deadline: Timespec,
) -> (WaitOutcome, Timespec) {
    check_preempt_depth();
    sched.resched();

    let rem = deadline.sub(clock.gettime());
    let rem = if rem < Timespec::ZERO { Timespec::ZERO } else { rem };
    match take_wake_reason(sched, id) {
        Some(reason) => (WaitOutcome::Woken(reason), rem),
        None => (WaitOutcome::Timeout, Timespec::ZERO),
    }
}

fn block_on(
    sched: &mut Scheduler,
    q: &mut WaitQueue,
    id: VcpuId,
    mask: SignalSet,
    deadline: Option<Timespec>,
) {
    sched.table_mut().get_mut(id).set_wait_link(WaitLink {
        reason: None,
        deadline,
        mask,
    });
    sched.park_current(id);
    q.queue.push_back(sched.table_mut(), id);
}

/// Reads back and clears the reason left by whoever woke `id`. `None` means
/// the waiter was removed by timeout expiry rather than an explicit wake.
fn take_wake_reason(sched: &mut Scheduler, id: VcpuId) -> Option<WakeReason> {
    let reason = sched.table().get(id).wait_link().reason;
    sched.table_mut().get_mut(id).clear_wait_link();
    reason
}

/// Wakes waiters on `q`. `WAKE_ALL` wakes every waiter; otherwise only the
/// head (FIFO). If `WAKE_CSW` is set and a woken vcpu outranks the caller,
/// the caller yields immediately instead of waiting for its own quantum to
/// expire.
pub fn wake(sched: &mut Scheduler, q: &mut WaitQueue, flags: WaitFlags, reason: WakeReason) {
    if wake_no_switch(sched, q, flags, reason) && flags.contains(WaitFlags::WAKE_CSW) {
        sched.yield_now();
    }
}

/// The pop-and-ready half of [`wake`], without the trailing `yield_now`.
/// A synchronization primitive that wakes waiters while still holding its
/// own state spinlock should call this instead of `wake`: popping a waiter
/// and marking it ready is cheap bookkeeping safe to do with preemption
/// disabled, but the actual context switch must wait until the lock (and the
/// preemption it disables) is released. Returns whether a woken waiter
/// outranks the current vcpu, so the caller can `yield_now` itself after
/// dropping its lock.
pub fn wake_no_switch(
    sched: &mut Scheduler,
    q: &mut WaitQueue,
    flags: WaitFlags,
    reason: WakeReason,
) -> bool {
    let current_prio = sched.current_priority();
    let mut woke_higher = false;

    if flags.contains(WaitFlags::WAKE_ALL) {
        while let Some(id) = q.queue.pop_front(sched.table_mut()) {
            if wake_one(sched, id, reason).is_more_important_than(current_prio) {
                woke_higher = true;
            }
        }
    } else if let Some(id) = q.queue.pop_front(sched.table_mut()) {
        if wake_one(sched, id, reason).is_more_important_than(current_prio) {
            woke_higher = true;
        }
    }

    woke_higher
}

/// Wakes at most `limit` waiters from the head of `q`, without switching.
/// The counting semaphore's `relinquish` uses this: it knows how many
/// permits just became available but not how many each queued waiter is
/// asking for, so it bounds the pop count by the permit count as a
/// conservative approximation. A waiter woken without enough permits simply
/// rechecks and re-enqueues itself (see `sync::sem::Semaphore::acquire`'s
/// retry loop), so over-waking only costs a spurious round trip, never
/// correctness.
pub fn wake_up_to_no_switch(
    sched: &mut Scheduler,
    q: &mut WaitQueue,
    limit: usize,
    reason: WakeReason,
) -> bool {
    let current_prio = sched.current_priority();
    let mut woke_higher = false;
    for _ in 0..limit {
        let Some(id) = q.queue.pop_front(sched.table_mut()) else {
            break;
        };
        if wake_one(sched, id, reason).is_more_important_than(current_prio) {
            woke_higher = true;
        }
    }
    woke_higher
}

fn wake_one(sched: &mut Scheduler, id: VcpuId, reason: WakeReason) -> abi::Priority {
    let mut link = sched.table().get(id).wait_link();
    link.reason = Some(reason);
    sched.table_mut().get_mut(id).set_wait_link(link);
    sched.make_ready(id);
    sched.table().get(id).priority()
}

/// Atomically wakes a waiter on `q1` (as [`wake`]) and blocks the current
/// vcpu on `q2` with a timed wait (as [`timedwait`]). Used by condition
/// variables to hand the mutex to a waiter without a lost-wakeup window: the
/// wake and the enqueue onto `q2` happen without the caller returning to
/// user-visible state in between.
pub fn wake_then_timedwait(
    sched: &mut Scheduler,
    clock: &Clock,
    q1: &mut WaitQueue,
    q2: &mut WaitQueue,
    mask: SignalSet,
    flags: WaitFlags,
    wtp: Timespec,
) -> (WaitOutcome, Timespec) {
    wake(sched, q1, flags & !WaitFlags::WAKE_CSW, WakeReason::Wakeup);
    timedwait(sched, clock, q2, mask, flags, wtp)
}

/// Removes every waiter on `q` whose deadline has passed as of `clock`'s
/// current time, marking each Ready with no wake reason (so the resumed
/// `timedwait` reports `Timeout`). Stands in for the clock IRQ's per-tick
/// scan of the timer list, scoped to one queue: call this wherever the
/// owning subsystem has a natural "tick" of its own, or drive it directly in
/// tests to simulate time passing.
pub fn expire_timeouts(sched: &mut Scheduler, clock: &Clock, q: &mut WaitQueue) {
    let now = clock.gettime();
    let mut expired: heapless::Vec<VcpuId, MAX_VCPUS> = heapless::Vec::new();
    for id in q.queue.iter(sched.table()) {
        if let Some(deadline) = sched.table().get(id).wait_link().deadline {
            if deadline <= now {
                let _ = expired.push(id);
            }
        }
    }
    for id in expired {
        q.queue.remove(sched.table_mut(), id);
        sched.make_ready(id);
    }
}

/// Delivers `signal` to `id`. If `id` is currently waiting on `q` and
/// `signal` is in its wait mask (or is the unblockable signal), it is
/// removed from `q` immediately with reason `Interrupted`; otherwise the
/// signal is simply recorded as pending. Returns whether the vcpu was woken.
pub fn deliver_signal(sched: &mut Scheduler, q: &mut WaitQueue, id: VcpuId, signal: u32) -> bool {
    sched.table_mut().get_mut(id).post_signal(signal);

    if sched.table().get(id).state() != VcpuSchedState::Waiting {
        return false;
    }

    let mut link = sched.table().get(id).wait_link();
    let interrupts = signal & (link.mask.0 | SignalSet::UNBLOCKABLE) != 0;
    if !interrupts {
        return false;
    }

    q.queue.remove(sched.table_mut(), id);
    link.reason = Some(WakeReason::Interrupted);
    sched.table_mut().get_mut(id).set_wait_link(link);
    sched.table_mut().get_mut(id).clear_signal(signal);
    sched.make_ready(id);
    true
}

#[cfg(test)]
impl WaitQueue {
    /// Pushes `id` directly onto the queue without going through
    /// `prepare_wait`, for tests (elsewhere in this crate) that need a
    /// queue pre-populated with a waiter they didn't block themselves.
    pub(crate) fn push_for_test(&mut self, table: &mut crate::vcpu::VcpuTable, id: VcpuId) {
        self.queue.push_back(table, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use abi::{Priority, QosClass};

    fn prio() -> Priority {
        Priority::new(QosClass::Utility, 0)
    }

    #[test]
    fn wake_one_delivers_fifo_order() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mut q = WaitQueue::new();
        // We can't literally block two vcpus concurrently from one thread of
        // control, so this test drives the queue machinery directly:
        // enqueue two ids as if they'd blocked, then confirm FIFO wake
        // order.
        let a = sched.acquire(prio()).unwrap();
        let b = sched.acquire(prio()).unwrap();
        sched.suspend(a);
        sched.suspend(b);
        sched
            .table_mut()
            .get_mut(a)
            .set_wait_link(WaitLink::default());
        sched
            .table_mut()
            .get_mut(b)
            .set_wait_link(WaitLink::default());
        q.queue.push_back(sched.table_mut(), a);
        q.queue.push_back(sched.table_mut(), b);

        wake(&mut sched, &mut q, WaitFlags::WAKE_ONE, WakeReason::Wakeup);
        assert_eq!(
            sched.table().get(a).wait_link().reason,
            Some(WakeReason::Wakeup)
        );
        assert!(q.queue.front() == Some(b));
    }

    #[test]
    fn pending_unblockable_signal_aborts_wait_immediately() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);
        sched
            .table_mut()
            .get_mut(boot)
            .post_signal(SignalSet::UNBLOCKABLE);

        let mut q = WaitQueue::new();
        let reason = wait(&mut sched, &mut q, SignalSet::NONE);
        assert_eq!(reason, WakeReason::Interrupted);
        assert!(q.is_empty());
    }

    #[test]
    fn timedwait_past_deadline_times_out_immediately() {
        let sched_clock = Clock::new(1_000_000);
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mut q = WaitQueue::new();
        let (outcome, _) =
            timedwait(&mut sched, &sched_clock, &mut q, SignalSet::NONE, WaitFlags::empty(), Timespec::ZERO);
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[test]
    fn expire_timeouts_wakes_past_deadline_waiters_with_no_reason() {
        let clock = Clock::new(1_000_000);
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mut q = WaitQueue::new();
        let a = sched.acquire(prio()).unwrap();
        sched.suspend(a);
        sched.table_mut().get_mut(a).set_wait_link(WaitLink {
            reason: None,
            deadline: Some(Timespec::from_ns(5_000_000)),
            mask: SignalSet::NONE,
        });
        q.queue.push_back(sched.table_mut(), a);

        for _ in 0..10 {
            clock.on_tick();
        }
        expire_timeouts(&mut sched, &clock, &mut q);

        assert!(q.is_empty());
        assert_eq!(sched.table().get(a).wait_link().reason, None);
    }

    #[test]
    fn deinit_fails_on_nonempty_queue() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);
        let mut q = WaitQueue::new();
        let a = sched.acquire(prio()).unwrap();
        sched.suspend(a);
        q.queue.push_back(sched.table_mut(), a);
        assert_eq!(q.deinit(), Err(KernError::Invalid));
        q.queue.pop_front(sched.table_mut());
        assert_eq!(q.deinit(), Ok(()));
    }

    #[test]
    fn deliver_signal_removes_matching_waiter() {
        let mut sched = Scheduler::new();
        let boot = sched.acquire(prio()).unwrap();
        sched.bootstrap_for_test(boot);

        let mut q = WaitQueue::new();
        let a = sched.acquire(prio()).unwrap();
        sched.suspend(a);
        sched.table_mut().get_mut(a).set_state(VcpuSchedState::Waiting);
        sched.table_mut().get_mut(a).set_wait_link(WaitLink {
            reason: None,
            deadline: None,
            mask: SignalSet(0x1),
        });
        q.queue.push_back(sched.table_mut(), a);

        let woke = deliver_signal(&mut sched, &mut q, a, 0x1);
        assert!(woke);
        assert!(q.is_empty());
        assert_eq!(
            sched.table().get(a).wait_link().reason,
            Some(WakeReason::Interrupted)
        );
    }
}
