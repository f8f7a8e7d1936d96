// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel core and its callers.
//!
//! These types carry no behavior beyond what's needed to describe the
//! kernel's external interfaces: time, priority, wakeup reasons, and the
//! small option/flag sets recognized by the allocator and wait queue.

#![cfg_attr(not(test), no_std)]

use core::cmp::Ordering;

/// Nanoseconds in one second, used throughout the timespec conversions.
pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// An absolute or relative point in time, canonicalized so that the sign of
/// a negative duration is always carried on `sec` when `sec != 0`.
///
/// Arithmetic on `Timespec` saturates: overflowing in either direction
/// clamps to [`Timespec::INF`] or its negation, rather than wrapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i32,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };

    /// Saturating upper bound for any `Timespec` value.
    pub const INF: Timespec = Timespec {
        sec: i64::MAX,
        nsec: NSEC_PER_SEC as i32 - 1,
    };

    /// Saturating lower bound: the negation of [`Timespec::INF`].
    pub const NEG_INF: Timespec = Timespec {
        sec: i64::MIN,
        nsec: -(NSEC_PER_SEC as i32 - 1),
    };

    pub const fn new(sec: i64, nsec: i32) -> Self {
        Self { sec, nsec }.canonicalize()
    }

    /// Puts `self` into canonical form by carrying `nsec` into `0..NSEC_PER_SEC`.
    pub const fn canonicalize(self) -> Self {
        let mut sec = self.sec;
        let mut nsec = self.nsec as i64;

        while nsec >= NSEC_PER_SEC {
            nsec -= NSEC_PER_SEC;
            sec += 1;
        }
        while nsec < 0 {
            nsec += NSEC_PER_SEC;
            sec -= 1;
        }

        Timespec {
            sec,
            nsec: nsec as i32,
        }
    }

    pub const fn from_ms(ms: i64) -> Self {
        Self::new(ms / 1000, ((ms % 1000) * 1_000_000) as i32)
    }

    pub const fn from_us(us: i64) -> Self {
        Self::new(us / 1_000_000, ((us % 1_000_000) * 1_000) as i32)
    }

    pub const fn from_ns(ns: i64) -> Self {
        Self::new(ns / NSEC_PER_SEC, (ns % NSEC_PER_SEC) as i32)
    }

    pub fn as_ns(self) -> i64 {
        self.sec
            .saturating_mul(NSEC_PER_SEC)
            .saturating_add(self.nsec as i64)
    }

    pub fn as_us(self) -> i64 {
        self.as_ns() / 1000
    }

    pub fn as_ms(self) -> i64 {
        self.as_ns() / 1_000_000
    }

    #[must_use]
    pub fn add(self, rhs: Timespec) -> Self {
        match self.sec.checked_add(rhs.sec) {
            Some(sec) => Self::new(sec, self.nsec + rhs.nsec),
            None => {
                if rhs.sec >= 0 {
                    Self::INF
                } else {
                    Self::NEG_INF
                }
            }
        }
    }

    #[must_use]
    pub fn sub(self, rhs: Timespec) -> Self {
        match self.sec.checked_sub(rhs.sec) {
            Some(sec) => Self::new(sec, self.nsec - rhs.nsec),
            None => {
                if rhs.sec >= 0 {
                    Self::NEG_INF
                } else {
                    Self::INF
                }
            }
        }
    }

    pub fn is_zero(self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

impl Ord for Timespec {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sec, self.nsec).cmp(&(other.sec, other.nsec))
    }
}

impl PartialOrd for Timespec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Rounding mode used when converting a [`Timespec`] that doesn't land on an
/// exact quantum boundary.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Rounding {
    TowardZero,
    AwayFromZero,
}

/// A 32-bit monotonic tick count since boot, saturating on overflow.
///
/// Callers needing absolute deadlines beyond the 32-bit horizon should pass
/// a [`Timespec`] instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Quantum(pub u32);

impl Quantum {
    pub const ZERO: Quantum = Quantum(0);

    #[must_use]
    pub fn saturating_add(self, rhs: u32) -> Self {
        Quantum(self.0.saturating_add(rhs))
    }
}

impl From<u32> for Quantum {
    fn from(v: u32) -> Self {
        Quantum(v)
    }
}

impl From<Quantum> for u32 {
    fn from(v: Quantum) -> Self {
        v.0
    }
}

/// QoS scheduling class, highest to lowest importance.
///
/// Classes are ordered so that `Realtime > ... > Idle`, higher variants
/// taking priority over lower ones.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum QosClass {
    Idle = 0,
    Background = 1,
    Utility = 2,
    Interactive = 3,
    Urgent = 4,
    Realtime = 5,
}

impl QosClass {
    pub const COUNT: usize = 6;

    /// Whether this class ages toward mid sub-priority after a quantum
    /// expiration. Realtime and Idle are fixed-priority; the rest are
    /// dynamic.
    pub fn is_dynamic(self) -> bool {
        !matches!(self, QosClass::Realtime | QosClass::Idle)
    }
}

impl Default for QosClass {
    fn default() -> Self {
        QosClass::Utility
    }
}

/// Number of sub-priorities per QoS class.
pub const SUB_PRIORITY_COUNT: usize = 16;

/// Sub-priority within a class, in `-8..=7`. Zero is the aging target for
/// dynamic classes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct SubPriority(i8);

impl SubPriority {
    pub const MIN: SubPriority = SubPriority(-8);
    pub const MID: SubPriority = SubPriority(0);
    pub const MAX: SubPriority = SubPriority(7);

    /// Clamps `v` into the legal `-8..=7` range.
    pub fn new(v: i8) -> Self {
        SubPriority(v.clamp(-8, 7))
    }

    pub fn get(self) -> i8 {
        self.0
    }

    /// Index of this sub-priority within a 16-slot ready-queue row, `0..16`.
    pub fn slot(self) -> usize {
        (self.0 as i16 + 8) as usize
    }
}

impl Default for SubPriority {
    fn default() -> Self {
        SubPriority::MID
    }
}

/// Full scheduling priority: a QoS class plus a sub-priority within it.
///
/// This intentionally does *not* derive `Ord`: comparisons that matter to
/// the scheduler go through [`Priority::is_more_important_than`], which
/// spells out in its name which direction wins, avoiding the ambiguity the
/// design notes call out around numerically-smaller-is-more-important
/// conventions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Priority {
    pub class: QosClass,
    pub sub: SubPriority,
}

impl Priority {
    pub fn new(class: QosClass, sub: i8) -> Self {
        Priority {
            class,
            sub: SubPriority::new(sub),
        }
    }

    pub fn is_more_important_than(self, other: Self) -> bool {
        (self.class, self.sub) > (other.class, other.sub)
    }
}

/// Scheduling state of a vcpu.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VcpuSchedState {
    /// On a ready queue, eligible to be selected by the scheduler.
    Ready,
    /// Currently installed on the (sole) CPU.
    Running,
    /// Blocked on a wait queue.
    Waiting,
    /// Cooperatively suspended; not on any queue.
    Suspended,
    /// Terminated; awaiting reclamation by the background reaper.
    Zombie,
}

/// The reason a wait returned, or why a waiter was removed from a queue.
///
/// A single enum, per the design notes' resolution of the source's two
/// spellings (`WRES_WAKEUP` vs. `WAKEUP_ALL`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WakeReason {
    /// Woken by an explicit `wake` call.
    Wakeup,
    /// Removed from the queue because an unmasked signal became pending.
    Interrupted,
}

bitflags::bitflags! {
    /// Flags recognized by `wake` and `timedwait`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct WaitFlags: u32 {
        /// Wake only the head-of-queue waiter.
        const WAKE_ONE = 1 << 0;
        /// Wake every waiter on the queue.
        const WAKE_ALL = 1 << 1;
        /// If a woken vcpu outranks the caller, yield immediately.
        const WAKE_CSW = 1 << 2;
        /// The deadline passed to `timedwait` is absolute, not relative to
        /// now.
        const WAIT_ABSTIME = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Options recognized by the heap allocator.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct AllocOptions: u32 {
        /// Zero the returned block before returning it.
        const CLEAR = 1 << 0;
        /// The block must be satisfiable from a CPU+DMA-reachable region.
        const UNIFIED = 1 << 1;
    }
}

/// Address-space class of a memory descriptor / heap region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Reachable by the CPU only.
    Cpu,
    /// Reachable by both the CPU and the chipset's bus-mastering engines.
    Unified,
}

impl MemoryKind {
    /// Whether a region of this kind can satisfy an [`AllocOptions::UNIFIED`]
    /// request.
    pub fn satisfies_unified(self) -> bool {
        matches!(self, MemoryKind::Unified)
    }
}

/// Describes one physical memory region available to the heap allocator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryDescriptor {
    pub lower: usize,
    pub upper: usize,
    pub kind: MemoryKind,
}

impl MemoryDescriptor {
    pub fn len(&self) -> usize {
        self.upper.saturating_sub(self.lower)
    }

    pub fn is_empty(&self) -> bool {
        self.upper <= self.lower
    }

    pub fn contains_range(&self, base: usize, len: usize) -> bool {
        let end = match base.checked_add(len) {
            Some(e) => e,
            None => return false,
        };
        base >= self.lower && end <= self.upper
    }
}

/// Maximum number of memory descriptors a `memory_layout` can hold.
pub const MAX_MEMORY_DESCRIPTORS: usize = 8;

/// Interrupt-layer statistics counters recognized by `get_stat`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InterruptStat {
    /// An interrupt fired for a source with no registered handler.
    Spurious,
    /// An interrupt fired before the controller finished initializing.
    Uninitialized,
    /// A non-maskable interrupt was taken.
    NonMaskable,
}

/// Errors returned to kernel callers.
///
/// `NotPermitted`, and `Invalid` when it covers a non-empty `deinit`, are
/// documented as fatal by policy: primitives built on top of the wait queue
/// (mutex, semaphore, condvar) never propagate them, they call the fatal
/// panic routine instead. The raw wait-queue `deinit` does return `Invalid`
/// to its direct caller: `deinit(q) -> ok | NotEmpty`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernError {
    /// Allocator exhaustion: no region could satisfy the request.
    NoMemory,
    /// A timed wait's deadline elapsed before the awaited event.
    Timeout,
    /// An unmasked, unblockable signal aborted the wait.
    Interrupted,
    /// A non-blocking `try_*` operation found the resource unavailable.
    Busy,
    /// An unlock was attempted by a vcpu that does not hold the lock. Fatal.
    NotPermitted,
    /// `deinit` was called on a non-empty queue, or a parameter was illegal.
    Invalid,
}

/// The outcome of a (possibly timed) wait: either a [`WakeReason`] or a
/// timeout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Woken(WakeReason),
    Timeout,
}

impl WaitOutcome {
    pub fn into_result(self) -> Result<WakeReason, KernError> {
        match self {
            WaitOutcome::Woken(WakeReason::Interrupted) => {
                Err(KernError::Interrupted)
            }
            WaitOutcome::Woken(r) => Ok(r),
            WaitOutcome::Timeout => Err(KernError::Timeout),
        }
    }
}

/// A set of signal numbers represented as a bitmask, used by wait-capable
/// calls to indicate which signals should remain unblocked while waiting.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct SignalSet(pub u32);

impl SignalSet {
    pub const NONE: SignalSet = SignalSet(0);

    /// The designated never-blockable signal (SIGKILL-equivalent): it
    /// always interrupts a wait regardless of the waiter-supplied mask.
    pub const UNBLOCKABLE: u32 = 1 << 31;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn with(self, bit: u32) -> Self {
        SignalSet(self.0 | bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_canonicalizes_overflowing_nsec() {
        let t = Timespec::new(1, 1_500_000_000);
        assert_eq!(t, Timespec::new(2, 500_000_000));
    }

    #[test]
    fn timespec_canonicalizes_negative_nsec() {
        let t = Timespec::new(2, -500_000_000);
        assert_eq!(t, Timespec::new(1, 500_000_000));
    }

    #[test]
    fn timespec_add_sub_roundtrip() {
        let a = Timespec::new(10, 250_000_000);
        let d = Timespec::new(3, 900_000_000);
        assert_eq!(a.add(d).sub(d), a);
    }

    #[test]
    fn timespec_add_saturates_to_inf() {
        let a = Timespec::new(i64::MAX, 0);
        let d = Timespec::new(1, 0);
        assert_eq!(a.add(d), Timespec::INF);
    }

    #[test]
    fn timespec_sub_saturates_to_neg_inf() {
        let a = Timespec::new(i64::MIN, 0);
        let d = Timespec::new(1, 0);
        assert_eq!(a.sub(d), Timespec::NEG_INF);
    }

    #[test]
    fn timespec_ordering() {
        assert!(Timespec::new(1, 0) < Timespec::new(1, 1));
        assert!(Timespec::new(0, 999_999_999) < Timespec::new(1, 0));
    }

    #[test]
    fn priority_class_dominates_sub_priority() {
        let hi = Priority::new(QosClass::Interactive, -8);
        let lo = Priority::new(QosClass::Utility, 7);
        assert!(hi.is_more_important_than(lo));
    }

    #[test]
    fn priority_sub_breaks_tie_within_class() {
        let hi = Priority::new(QosClass::Urgent, 3);
        let lo = Priority::new(QosClass::Urgent, -2);
        assert!(hi.is_more_important_than(lo));
        assert!(!lo.is_more_important_than(hi));
    }

    #[test]
    fn sub_priority_slot_spans_full_range() {
        assert_eq!(SubPriority::new(-8).slot(), 0);
        assert_eq!(SubPriority::new(7).slot(), 15);
        assert_eq!(SubPriority::new(0).slot(), 8);
    }

    #[test]
    fn memory_descriptor_contains_range() {
        let d = MemoryDescriptor {
            lower: 0x1000,
            upper: 0x2000,
            kind: MemoryKind::Cpu,
        };
        assert!(d.contains_range(0x1000, 0x1000));
        assert!(!d.contains_range(0x1000, 0x1001));
        assert!(!d.contains_range(0x0ff0, 0x10));
    }
}
