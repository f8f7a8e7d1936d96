// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduled unit of execution: a virtual processor (vcpu) record.
//!
//! A vcpu is created by the process layer (out of scope for this core) and
//! handed to the scheduler via [`VcpuTable::acquire`]; it returns to the
//! pool via [`VcpuTable::relinquish`]. This module only holds the record and
//! the fixed-capacity table it lives in; scheduling policy (ready queues,
//! priority scan, context switch) is [`crate::sched`]'s job.

use abi::{Priority, QosClass, SignalSet, Timespec, VcpuSchedState, WakeReason};

use crate::arch;
use crate::config::MAX_VCPUS;

/// Identifies a vcpu by its slot in the scheduler's table plus the
/// generation that slot was handed out under.
///
/// The index is in the low bits, the generation in the high bits.
/// `VcpuTable` bumps a slot's generation every time it is reaped, so an id
/// captured before a `relinquish`/`reap` cycle no longer matches the slot it
/// names and [`VcpuTable::get`] et al. treat it as dead rather than silently
/// aliasing whatever vcpu was acquired next.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VcpuId(pub u32);

impl VcpuId {
    const INDEX_BITS: u32 = 24;
    const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        VcpuId((index as u32 & Self::INDEX_MASK) | (gen.0 << Self::INDEX_BITS))
    }

    pub fn index(&self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    pub fn generation(&self) -> Generation {
        Generation(self.0 >> Self::INDEX_BITS)
    }
}

/// A slot's incarnation counter. Wraps on overflow rather than refusing to
/// reuse the slot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Generation(u32);

impl Generation {
    const BITS: u32 = 32 - VcpuId::INDEX_BITS;
    const MASK: u32 = (1 << Self::BITS) - 1;

    fn next(self) -> Self {
        Generation(self.0.wrapping_add(1) & Self::MASK)
    }
}

/// Per-vcpu wait-queue linkage: why the vcpu is on a queue and its
/// deadline/mask if any. The wait queue itself only holds FIFO ordering of
/// ids; this is the transient linkage the data model describes the queue as
/// not owning.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitLink {
    pub reason: Option<WakeReason>,
    pub deadline: Option<Timespec>,
    pub mask: SignalSet,
}

/// A virtual processor: id, priority, scheduling state, saved context, and
/// the bookkeeping needed to block on a wait queue.
///
/// `link` is the intrusive doubly-linked-list membership used by whichever
/// queue currently holds this vcpu (a ready queue or a wait queue, never
/// both, matching the "on exactly one queue" invariant); see
/// [`crate::intrusive`].
#[derive(Debug)]
pub struct Vcpu {
    save: arch::SavedState,
    priority: Priority,
    state: VcpuSchedState,
    wait: WaitLink,
    pending_signals: SignalSet,
    pub(crate) link: Link,
    pub(crate) quantum_remaining: u8,
}

/// Prev/next pointers for whichever intrusive queue currently owns this
/// vcpu.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Link {
    pub prev: Option<VcpuId>,
    pub next: Option<VcpuId>,
}

impl Vcpu {
    fn new(priority: Priority) -> Self {
        Vcpu {
            save: arch::SavedState::default(),
            priority,
            state: VcpuSchedState::Suspended,
            wait: WaitLink::default(),
            pending_signals: SignalSet::NONE,
            link: Link::default(),
            quantum_remaining: 0,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn state(&self) -> VcpuSchedState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: VcpuSchedState) {
        self.state = state;
    }

    pub fn wait_link(&self) -> WaitLink {
        self.wait
    }

    pub(crate) fn set_wait_link(&mut self, link: WaitLink) {
        self.wait = link;
    }

    pub(crate) fn clear_wait_link(&mut self) {
        self.wait = WaitLink::default();
    }

    pub fn save(&self) -> &arch::SavedState {
        &self.save
    }

    pub(crate) fn save_mut(&mut self) -> &mut arch::SavedState {
        &mut self.save
    }

    /// Posts `signal` to this vcpu's pending set. A waiter whose mask
    /// includes `signal` (or the unblockable signal) should be removed from
    /// its wait queue with reason `Interrupted`; that check happens in
    /// [`crate::waitqueue`], which is the only place a pending signal is
    /// observed while blocked.
    pub fn post_signal(&mut self, signal: u32) {
        self.pending_signals = self.pending_signals.with(signal);
    }

    pub fn pending_signals(&self) -> SignalSet {
        self.pending_signals
    }

    pub(crate) fn clear_signal(&mut self, signal: u32) {
        self.pending_signals = SignalSet(self.pending_signals.0 & !signal);
    }
}

enum Slot {
    Empty,
    Occupied(Vcpu),
}

/// Fixed-capacity table of vcpu records, indexed by [`VcpuId`].
///
/// Slots are reused: `relinquish` marks a vcpu Zombie, and a background
/// reaper (`reap`) frees the slot for a later `acquire`, bumping the
/// generation so a stale id can be detected as dead.
pub struct VcpuTable {
    slots: [Slot; MAX_VCPUS],
    generations: [Generation; MAX_VCPUS],
}

impl VcpuTable {
    pub fn new() -> Self {
        VcpuTable {
            slots: core::array::from_fn(|_| Slot::Empty),
            generations: [Generation::default(); MAX_VCPUS],
        }
    }

    /// Allocates a free slot for a new vcpu at `priority`, initially
    /// Suspended. Returns `None` if the table is full.
    pub fn acquire(&mut self, priority: Priority) -> Option<VcpuId> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot, Slot::Empty) {
                *slot = Slot::Occupied(Vcpu::new(priority));
                return Some(VcpuId::for_index_and_gen(i, self.generations[i]));
            }
        }
        None
    }

    /// Marks `id` Zombie. Its slot is not reusable until [`VcpuTable::reap`]
    /// runs.
    ///
    /// # Panics
    ///
    /// If `id` is not currently occupied, or the vcpu is Running or on a
    /// queue (callers must park it first).
    pub fn relinquish(&mut self, id: VcpuId) {
        let v = self.get_mut(id);
        debug_assert!(
            matches!(v.state, VcpuSchedState::Suspended | VcpuSchedState::Ready),
            "relinquish of a vcpu that is still Running or Waiting",
        );
        v.state = VcpuSchedState::Zombie;
    }

    /// Reclaims every Zombie slot, bumping its generation. Called by a
    /// background reaper at a convenient point, never from IRQ context.
    pub fn reap(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Slot::Occupied(v) = slot {
                if v.state == VcpuSchedState::Zombie {
                    self.generations[i] = self.generations[i].next();
                    *slot = Slot::Empty;
                }
            }
        }
    }

    /// Returns the occupant of `id`'s slot, provided `id`'s generation still
    /// matches.
    fn check(&self, id: VcpuId) -> Option<&Vcpu> {
        let i = id.index();
        if self.generations.get(i).copied()? != id.generation() {
            return None;
        }
        match &self.slots[i] {
            Slot::Occupied(v) => Some(v),
            Slot::Empty => None,
        }
    }

    fn check_mut(&mut self, id: VcpuId) -> Option<&mut Vcpu> {
        let i = id.index();
        if self.generations.get(i).copied()? != id.generation() {
            return None;
        }
        match &mut self.slots[i] {
            Slot::Occupied(v) => Some(v),
            Slot::Empty => None,
        }
    }

    /// # Panics
    ///
    /// If `id` is stale (slot reaped and possibly reacquired since) or out
    /// of range.
    pub fn get(&self, id: VcpuId) -> &Vcpu {
        self.check(id)
            .unwrap_or_else(|| panic!("vcpu {} is not occupied", id.index()))
    }

    /// # Panics
    ///
    /// If `id` is stale or out of range.
    pub fn get_mut(&mut self, id: VcpuId) -> &mut Vcpu {
        let idx = id.index();
        self.check_mut(id)
            .unwrap_or_else(|| panic!("vcpu {idx} is not occupied"))
    }

    pub fn try_get(&self, id: VcpuId) -> Option<&Vcpu> {
        self.check(id)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = VcpuId> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            matches!(s, Slot::Occupied(_))
                .then(|| VcpuId::for_index_and_gen(i, self.generations[i]))
        })
    }

    /// Links `id` between `prev` and `next` in whichever intrusive queue is
    /// assembling it. Used only by [`crate::intrusive::IntrusiveQueue`].
    pub(crate) fn set_link(
        &mut self,
        id: VcpuId,
        prev: Option<VcpuId>,
        next: Option<VcpuId>,
    ) {
        self.get_mut(id).link = Link { prev, next };
    }

    pub(crate) fn set_next(&mut self, id: VcpuId, next: Option<VcpuId>) {
        self.get_mut(id).link.next = next;
    }

    pub(crate) fn set_prev(&mut self, id: VcpuId, prev: Option<VcpuId>) {
        self.get_mut(id).link.prev = prev;
    }

    pub(crate) fn link_of(&self, id: VcpuId) -> (Option<VcpuId>, Option<VcpuId>) {
        let link = &self.get(id).link;
        (link.prev, link.next)
    }

    pub(crate) fn clear_link(&mut self, id: VcpuId) {
        self.get_mut(id).link = Link::default();
    }

    /// Borrows two distinct slots mutably at once, needed to snapshot the
    /// outgoing vcpu's context while installing the incoming one's.
    ///
    /// # Panics
    ///
    /// If `a == b`, or if either slot is unoccupied.
    pub(crate) fn get2_mut(
        &mut self,
        a: VcpuId,
        b: VcpuId,
    ) -> (&mut Vcpu, &mut Vcpu) {
        let (ai, bi) = (a.index(), b.index());
        assert_ne!(ai, bi, "get2_mut called with the same id twice");
        assert_eq!(self.generations[ai], a.generation(), "vcpu {ai} is stale");
        assert_eq!(self.generations[bi], b.generation(), "vcpu {bi} is stale");
        let (lo, hi, swapped) = if ai < bi {
            (ai, bi, false)
        } else {
            (bi, ai, true)
        };
        let (left, right) = self.slots.split_at_mut(hi);
        let first = match &mut left[lo] {
            Slot::Occupied(v) => v,
            Slot::Empty => panic!("vcpu {lo} is not occupied"),
        };
        let second = match &mut right[0] {
            Slot::Occupied(v) => v,
            Slot::Empty => panic!("vcpu {hi} is not occupied"),
        };
        if swapped {
            (second, first)
        } else {
            (first, second)
        }
    }
}

impl Default for VcpuTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Default QoS used for vcpus acquired without an explicit priority, mirroring
/// `abi::QosClass`'s own default.
pub fn default_priority() -> Priority {
    Priority::new(QosClass::Utility, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_relinquish_reap_cycle() {
        let mut table = VcpuTable::new();
        let id = table.acquire(default_priority()).unwrap();
        assert_eq!(table.get(id).state(), VcpuSchedState::Suspended);
        table.get_mut(id).set_state(VcpuSchedState::Ready);
        table.relinquish(id);
        assert_eq!(table.get(id).state(), VcpuSchedState::Zombie);
        table.reap();
        assert!(table.try_get(id).is_none());
        // slot reusable after reap, but the reused id carries a bumped
        // generation so the stale id above stays dead forever.
        let id2 = table.acquire(default_priority()).unwrap();
        assert_eq!(id2.index(), id.index());
        assert_ne!(id2, id);
        assert!(table.try_get(id).is_none());
        assert_eq!(table.get(id2).state(), VcpuSchedState::Suspended);
    }

    #[test]
    #[should_panic(expected = "is not occupied")]
    fn stale_id_is_rejected_after_reuse() {
        let mut table = VcpuTable::new();
        let id = table.acquire(default_priority()).unwrap();
        table.relinquish(id);
        table.reap();
        table.acquire(default_priority()).unwrap();
        table.get(id);
    }

    #[test]
    fn acquire_fails_when_full() {
        let mut table = VcpuTable::new();
        for _ in 0..table.capacity() {
            table.acquire(default_priority()).unwrap();
        }
        assert!(table.acquire(default_priority()).is_none());
    }
}
