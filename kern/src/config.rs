// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time configuration constants.
//!
//! The kernel prefers a single build-time-fixed shape over runtime
//! configuration wherever the shape doesn't depend on what's plugged into
//! the machine (c.f. the heap's `memory_layout`, which *is* discovered at
//! boot and so is not here).

use abi::QosClass;

/// Maximum number of vcpus the scheduler can track simultaneously.
pub const MAX_VCPUS: usize = 64;

/// Number of sub-priorities per QoS class (`abi::SUB_PRIORITY_COUNT`,
/// restated here as the shape of the ready-queue table).
pub const SUB_PRIORITIES_PER_CLASS: usize = abi::SUB_PRIORITY_COUNT;

/// Number of QoS classes (`abi::QosClass::COUNT`, restated here as the shape
/// of the ready-queue table).
pub const QOS_CLASS_COUNT: usize = QosClass::COUNT;

/// Nanoseconds per scheduler quantum. The quantum timer fires at this
/// period.
pub const NS_PER_QUANTUM: u32 = 1_000_000; // 1 ms

/// Ceiling on `clock::delay`'s hard spin, matching the original `machine/
/// clock.h`'s `CLOCK_DELAY_MAX_NSEC`. Waits longer than this must use a
/// wait queue instead.
pub const MAX_SHORT_DELAY_NS: u32 = 1_000_000; // 1 ms

/// Estimated CPU cycles burned hard-spinning for one nanosecond, used only
/// by the m68k backend to calibrate `arch::hard_spin`. Derived from a
/// nominal 7.09 MHz bus clock; real hardware should calibrate this against
/// the monotonic clock at boot, but a fixed estimate keeps this core free of
/// a runtime calibration step.
const NOMINAL_CYCLES_PER_NS: u32 = 7;

pub fn spin_cycles_for_ns(ns: u32) -> u32 {
    ns.saturating_mul(NOMINAL_CYCLES_PER_NS)
}

/// Fixed capacity of a `memory_layout`.
pub const MAX_MEMORY_DESCRIPTORS: usize = abi::MAX_MEMORY_DESCRIPTORS;

/// Minimum word alignment for heap allocations, matching the platform word
/// size.
pub const HEAP_ALIGN: usize = core::mem::size_of::<usize>();

/// Quantum-timer ticks granted per scheduling turn, by QoS class. Shorter
/// for higher classes (lower wakeup latency), longest for background work.
pub fn quantum_ticks_for_class(class: QosClass) -> u8 {
    match class {
        QosClass::Realtime => 2,
        QosClass::Urgent => 4,
        QosClass::Interactive => 8,
        QosClass::Utility => 12,
        QosClass::Background => 20,
        QosClass::Idle => u8::MAX,
    }
}

/// Maximum number of interrupt handlers in one source's priority-ordered
/// chain.
pub const MAX_HANDLERS_PER_SOURCE: usize = 8;

/// Number of interrupt sources the interrupt layer tracks.
pub const IRQ_SOURCE_COUNT: usize = 32;
