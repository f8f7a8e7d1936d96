// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated architecture backend used only for host-side testing.
//!
//! Real context switching, interrupt vector wiring, and the m68k trap frame
//! layout are all out of reach on the host; this backend tracks just enough
//! state for scheduler, wait-queue, and sync-primitive tests to observe that
//! the right decisions were made.
//!
//! All state here is thread-local rather than a true global: `cargo test`
//! runs each test on its own thread, and without this, unrelated tests would
//! race on what's supposed to be a single simulated CPU.

use core::cell::Cell;
use core::fmt;

/// Opaque saved machine context. A real backend stores the integer/FP
/// register file, program counter, and status register here; the simulator
/// only needs a placeholder so vcpu bookkeeping can exercise the
/// save/restore call sites.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct SavedState {
    pub(crate) marker: u32,
}

/// Raw hardware interrupt-mask representation. On m68k this is the saved
/// `SR` interrupt-priority field; here it's just "was everything already
/// masked".
pub type RawIrqMask = bool;

std::thread_local! {
    static IRQ_MASKED: Cell<bool> = const { Cell::new(false) };
    static CURRENT_VCPU: Cell<u32> = const { Cell::new(0) };
    static SWITCH_COUNT: Cell<u32> = const { Cell::new(0) };
    static SPIN_NS_TOTAL: Cell<u64> = const { Cell::new(0) };
}

/// Masks every maskable interrupt source, returning the previous mask so it
/// can be restored exactly.
pub fn raw_mask_disable_all() -> RawIrqMask {
    IRQ_MASKED.with(|m| m.replace(true))
}

/// Restores a mask previously returned by [`raw_mask_disable_all`].
pub fn raw_mask_restore(old: RawIrqMask) {
    IRQ_MASKED.with(|m| m.set(old));
}

pub fn irq_masked() -> bool {
    IRQ_MASKED.with(Cell::get)
}

/// Stands in for `clock_delay`'s hard spin. Tests don't want to actually
/// block, so this just tallies requested nanoseconds for assertions.
pub fn hard_spin(ns: u32) {
    SPIN_NS_TOTAL.with(|t| t.set(t.get() + u64::from(ns)));
}

/// Total nanoseconds requested via [`hard_spin`] on this thread so far.
/// Test-only: exposed so delay-bound tests can assert against it without
/// actually waiting.
pub fn spun_ns_total() -> u64 {
    SPIN_NS_TOTAL.with(Cell::get)
}

/// Records a context switch into vcpu `to_id`. Scheduler tests assert
/// against [`current_vcpu`] and [`switch_count`] instead of inspecting real
/// machine registers.
pub fn switch_context(from: &mut SavedState, to: &SavedState, to_id: u32) {
    from.marker = from.marker.wrapping_add(1);
    let _ = to;
    SWITCH_COUNT.with(|c| c.set(c.get() + 1));
    CURRENT_VCPU.with(|v| v.set(to_id));
}

/// Installs `to` as the initial machine state and never returns, the way
/// entering userland never returns on real hardware. The simulator has no
/// userland, so this always panics; tests exercise the scheduler without
/// calling it.
pub fn switch_to_boot_vcpu(to: &SavedState, to_id: u32) -> ! {
    let _ = to;
    CURRENT_VCPU.with(|v| v.set(to_id));
    panic!("switch_to_boot_vcpu: simulator has no userland to enter");
}

pub fn current_vcpu() -> u32 {
    CURRENT_VCPU.with(Cell::get)
}

pub fn switch_count() -> u32 {
    SWITCH_COUNT.with(Cell::get)
}

/// Minimal structured-log sink. Tests don't assert on log text, but routing
/// through a real sink (rather than compiling `klog!` away entirely)
/// exercises the same call sites the real backend would.
pub fn klog_write(args: fmt::Arguments<'_>) {
    eprintln!("[kern] {args}");
}

/// Structured trace point used at scheduler transitions, interrupt handler
/// (un)registration, heap region addition, and fatal-panic entry.
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::arch::klog_write(format_args!($($arg)*))
    };
}
