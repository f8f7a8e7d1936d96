// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-priority preemptive scheduler.
//!
//! Six QoS classes times sixteen sub-priorities give a ready set scanned
//! highest-to-lowest; within one `(class, sub)` queue, FIFO. Dynamic classes
//! age toward mid sub-priority on quantum expiry; `Realtime` and `Idle` are
//! fixed and never age.

use abi::{Priority, VcpuSchedState};

use crate::arch;
use crate::config::{QOS_CLASS_COUNT, SUB_PRIORITIES_PER_CLASS};
use crate::fail;
use crate::intrusive::IntrusiveQueue;
use crate::vcpu::{VcpuId, VcpuTable};

/// Owns the vcpu table, the ready set, and the notion of "currently
/// running". This is the scheduler singleton; exactly one exists in the
/// running kernel, but tests construct their own freely.
pub struct Scheduler {
    table: VcpuTable,
    ready: [[IntrusiveQueue; SUB_PRIORITIES_PER_CLASS]; QOS_CLASS_COUNT],
    current: Option<VcpuId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            table: VcpuTable::new(),
            ready: [[IntrusiveQueue::new(); SUB_PRIORITIES_PER_CLASS];
                QOS_CLASS_COUNT],
            current: None,
        }
    }

    pub fn table(&self) -> &VcpuTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut VcpuTable {
        &mut self.table
    }

    /// Creates a vcpu at `priority` and makes it Ready immediately (Created
    /// → Ready in the lifecycle).
    pub fn acquire(&mut self, priority: Priority) -> Option<VcpuId> {
        let id = self.table.acquire(priority)?;
        self.reset_quantum(id);
        self.make_ready(id);
        Some(id)
    }

    /// Returns the currently running vcpu.
    ///
    /// # Panics
    ///
    /// If called before the first [`Scheduler::switch_to_boot_vcpu`] (or, in
    /// tests, before any switch has occurred).
    pub fn current_id(&self) -> VcpuId {
        self.current.expect("scheduler has no current vcpu yet")
    }

    pub fn current_priority(&self) -> Priority {
        self.table.get(self.current_id()).priority()
    }

    /// One-time bootstrap: installs `id`'s saved state as the initial
    /// machine state. Never returns on real hardware; in the simulator it
    /// panics, since there's no userland to enter, but records `id` as
    /// current first so scheduler state stays consistent for any code that
    /// runs in a panic hook.
    pub fn switch_to_boot_vcpu(&mut self, id: VcpuId) -> ! {
        self.remove_from_ready(id);
        self.table.get_mut(id).set_state(VcpuSchedState::Running);
        self.current = Some(id);
        let save = *self.table.get(id).save();
        arch::switch_to_boot_vcpu(&save, id.index() as u32)
    }

    /// Puts `id` onto its priority's ready queue and marks it Ready. Used
    /// both for newly acquired vcpus and for waking a Waiting/Suspended one.
    pub(crate) fn make_ready(&mut self, id: VcpuId) {
        self.table.get_mut(id).set_state(VcpuSchedState::Ready);
        self.enqueue_ready(id);
    }

    /// Marks the current vcpu `id` Waiting, just before `crate::waitqueue`
    /// parks it on a wait queue. `resched`'s "still Running" check is what
    /// tells a voluntary yield apart from a block, so this must run before
    /// the next `resched`.
    ///
    /// # Panics
    ///
    /// If `id` is not the current vcpu.
    pub(crate) fn park_current(&mut self, id: VcpuId) {
        assert_eq!(self.current, Some(id), "park_current called on a non-current vcpu");
        self.table.get_mut(id).set_state(VcpuSchedState::Waiting);
    }

    fn enqueue_ready(&mut self, id: VcpuId) {
        let p = self.table.get(id).priority();
        self.ready[p.class as usize][p.sub.slot()]
            .push_back(&mut self.table, id);
    }

    fn remove_from_ready(&mut self, id: VcpuId) {
        let p = self.table.get(id).priority();
        self.ready[p.class as usize][p.sub.slot()].remove(&mut self.table, id);
    }

    fn select_next(&mut self) -> VcpuId {
        for class in (0..QOS_CLASS_COUNT).rev() {
            for slot in (0..SUB_PRIORITIES_PER_CLASS).rev() {
                if let Some(id) = self.ready[class][slot].pop_front(&mut self.table)
                {
                    return id;
                }
            }
        }
        fail::die("scheduler: no runnable vcpu (is the idle vcpu missing?)")
    }

    /// Transfers the CPU to the highest-priority ready vcpu.
    ///
    /// If the outgoing vcpu is still `Running`, it's moved to Ready and
    /// appended to its ready queue first; if it's already Waiting or
    /// Suspended, the caller has already parked it on the appropriate queue
    /// and this leaves it alone.
    pub(crate) fn resched(&mut self) {
        if let Some(cur) = self.current {
            if self.table.get(cur).state() == VcpuSchedState::Running {
                self.enqueue_ready(cur);
                self.table.get_mut(cur).set_state(VcpuSchedState::Ready);
            }
        }
        let next = self.select_next();
        self.switch_to(next);
    }

    fn switch_to(&mut self, next: VcpuId) {
        match self.current {
            Some(from) if from != next => {
                klog!("sched: switch vcpu {} -> {}", from.index(), next.index());
                let (from_v, next_v) = self.table.get2_mut(from, next);
                next_v.set_state(VcpuSchedState::Running);
                arch::switch_context(
                    from_v.save_mut(),
                    next_v.save(),
                    next.index() as u32,
                );
            }
            _ => {
                self.table.get_mut(next).set_state(VcpuSchedState::Running);
            }
        }
        self.current = Some(next);
    }

    /// Explicit yield: always triggers a context switch (to the next
    /// highest-priority ready vcpu, which may be the caller itself if no
    /// other vcpu at equal priority is waiting).
    pub fn yield_now(&mut self) {
        self.resched();
    }

    /// Removes `id` from the ready set and marks it Suspended.
    ///
    /// Suspend/resume is cooperative: it only affects queue membership, not
    /// whether a vcpu is currently running. Suspending the running vcpu
    /// itself isn't meaningful through this entry point.
    ///
    /// # Panics
    ///
    /// If `id` isn't currently Ready.
    pub fn suspend(&mut self, id: VcpuId) {
        assert_eq!(
            self.table.get(id).state(),
            VcpuSchedState::Ready,
            "suspend only applies to a Ready vcpu",
        );
        self.remove_from_ready(id);
        self.table.get_mut(id).set_state(VcpuSchedState::Suspended);
    }

    /// Returns `id` from Suspended to Ready.
    ///
    /// # Panics
    ///
    /// If `id` isn't currently Suspended.
    pub fn resume(&mut self, id: VcpuId) {
        assert_eq!(
            self.table.get(id).state(),
            VcpuSchedState::Suspended,
            "resume only applies to a Suspended vcpu",
        );
        self.make_ready(id);
    }

    /// Changes `id`'s QoS class and sub-priority. If `id` is currently
    /// Ready, it's moved to the new priority's ready queue immediately.
    pub fn set_params(&mut self, id: VcpuId, priority: Priority) {
        let was_ready = self.table.get(id).state() == VcpuSchedState::Ready;
        if was_ready {
            self.remove_from_ready(id);
        }
        self.table.get_mut(id).set_priority(priority);
        self.reset_quantum(id);
        if was_ready {
            self.enqueue_ready(id);
        }
    }

    /// Terminates `id`: removes it from the ready set (if present) and marks
    /// it Zombie. Its slot is reclaimed later by [`VcpuTable::reap`].
    pub fn relinquish(&mut self, id: VcpuId) {
        if self.table.get(id).state() == VcpuSchedState::Ready {
            self.remove_from_ready(id);
        }
        self.table.get_mut(id).set_state(VcpuSchedState::Suspended);
        self.table.relinquish(id);
        if self.current == Some(id) {
            self.resched();
        }
    }

    fn reset_quantum(&mut self, id: VcpuId) {
        let class = self.table.get(id).priority().class;
        self.table.get_mut(id).quantum_remaining =
            crate::config::quantum_ticks_for_class(class);
    }

    fn age_if_dynamic(&mut self, id: VcpuId) {
        let p = self.table.get(id).priority();
        if !p.class.is_dynamic() {
            return;
        }
        let new_sub = p.sub.get() + (0 - p.sub.get()).signum();
        self.table
            .get_mut(id)
            .set_priority(Priority::new(p.class, new_sub));
    }

    fn higher_priority_ready(&self, than: Priority) -> bool {
        let than_key = (than.class as usize, than.sub.slot());
        for class in (0..QOS_CLASS_COUNT).rev() {
            for slot in (0..SUB_PRIORITIES_PER_CLASS).rev() {
                if self.ready[class][slot].is_empty() {
                    continue;
                }
                return (class, slot) > than_key;
            }
        }
        false
    }

    fn same_priority_ready(&self, prio: Priority) -> bool {
        !self.ready[prio.class as usize][prio.sub.slot()].is_empty()
    }

    /// Called on every quantum-timer tick. Decrements the current vcpu's
    /// remaining quantum, ages it if it's a dynamic class and the quantum
    /// expired, and triggers a context switch if a higher-priority vcpu has
    /// become ready, or the quantum expired while a peer of equal priority
    /// is waiting.
    pub fn on_quantum_tick(&mut self) {
        let Some(cur) = self.current else { return };
        let prio = self.table.get(cur).priority();

        let exhausted = {
            let v = self.table.get_mut(cur);
            v.quantum_remaining = v.quantum_remaining.saturating_sub(1);
            v.quantum_remaining == 0
        };

        if exhausted {
            self.age_if_dynamic(cur);
            self.reset_quantum(cur);
        }

        let must_switch = self.higher_priority_ready(prio)
            || (exhausted && self.same_priority_ready(prio));

        if must_switch {
            self.resched();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Scheduler {
    /// Test-only: installs `id` as current without invoking the (panicking)
    /// simulator boot jump. Real boot always goes through
    /// [`Scheduler::switch_to_boot_vcpu`], which never returns; tests across
    /// this crate use this instead to get a bootstrapped scheduler they can
    /// keep driving.
    pub(crate) fn bootstrap_for_test(&mut self, id: VcpuId) {
        self.remove_from_ready(id);
        self.table.get_mut(id).set_state(VcpuSchedState::Running);
        self.current = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::QosClass;

    fn prio(class: QosClass, sub: i8) -> Priority {
        Priority::new(class, sub)
    }

    #[test]
    fn higher_priority_preempts_lower() {
        let mut s = Scheduler::new();
        let idle = s.acquire(prio(QosClass::Idle, 0)).unwrap();
        s.bootstrap_for_test(idle);

        let low = s.acquire(prio(QosClass::Interactive, 0)).unwrap();
        s.resched(); // idle yields to low
        assert_eq!(s.current_id(), low);

        let high = s.acquire(prio(QosClass::Realtime, 0)).unwrap();
        assert!(s.higher_priority_ready(s.current_priority()));
        s.resched();
        assert_eq!(s.current_id(), high);
    }

    #[test]
    fn fifo_within_same_priority() {
        let mut s = Scheduler::new();
        let boot = s.acquire(prio(QosClass::Utility, 0)).unwrap();
        s.bootstrap_for_test(boot);

        let a = s.acquire(prio(QosClass::Utility, 0)).unwrap();
        let b = s.acquire(prio(QosClass::Utility, 0)).unwrap();

        s.resched();
        assert_eq!(s.current_id(), a);
        s.resched();
        assert_eq!(s.current_id(), b);
        s.resched();
        assert_eq!(s.current_id(), boot);
    }

    #[test]
    fn suspend_resume_round_trip() {
        let mut s = Scheduler::new();
        let boot = s.acquire(prio(QosClass::Utility, 0)).unwrap();
        s.bootstrap_for_test(boot);
        let a = s.acquire(prio(QosClass::Utility, 0)).unwrap();
        s.suspend(a);
        s.resched();
        // a was suspended, so boot should be the only one left besides
        // itself; resched picks boot again since it's the lone ready vcpu.
        assert_eq!(s.current_id(), boot);
        s.resume(a);
        s.resched();
        assert_eq!(s.current_id(), a);
    }

    #[test]
    fn dynamic_class_ages_toward_mid_on_expiry() {
        let mut s = Scheduler::new();
        let boot = s.acquire(prio(QosClass::Idle, 0)).unwrap();
        s.bootstrap_for_test(boot);
        let a = s.acquire(prio(QosClass::Utility, 7)).unwrap();
        s.resched();
        assert_eq!(s.current_id(), a);

        let ticks = crate::config::quantum_ticks_for_class(QosClass::Utility);
        for _ in 0..ticks {
            s.on_quantum_tick();
        }
        assert_eq!(s.table().get(a).priority().sub.get(), 6);
    }

    #[test]
    fn fixed_class_does_not_age() {
        let mut s = Scheduler::new();
        let boot = s.acquire(prio(QosClass::Idle, 0)).unwrap();
        s.bootstrap_for_test(boot);
        let a = s.acquire(prio(QosClass::Realtime, 3)).unwrap();
        s.resched();
        let ticks = crate::config::quantum_ticks_for_class(QosClass::Realtime);
        for _ in 0..ticks {
            s.on_quantum_tick();
        }
        assert_eq!(s.table().get(a).priority().sub.get(), 3);
    }
}
