// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! m68k (Amiga) architecture backend.
//!
//! This is compiled only when targeting `m68k-unknown-amigaos` and is not
//! exercised by the host test suite; `arch::sim` stands in there. The
//! register and trap-frame conventions below follow the machine layer of
//! the original C kernel this core was distilled from.

use core::arch::{asm, global_asm};
use core::fmt;

/// Saved machine context for a vcpu: the integer register file, the user
/// and kernel stack pointers, the program counter, and the status register.
///
/// `ksp` is what makes a context switch a resumable coroutine rather than a
/// one-way jump: it is this vcpu's supervisor stack pointer at the moment it
/// last called into [`switch_context`], so switching back in is just a
/// matter of restoring `ksp` and returning into whatever called us. The
/// portable parts of the kernel never interpret these fields; they're opaque
/// bytes handed to `switch_context`/`switch_to_boot_vcpu`. Field order here
/// matches the byte offsets the assembly in this file indexes into.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedState {
    pub d: [u32; 8],
    pub a: [u32; 7],
    pub usp: u32,
    pub ksp: u32,
    pub pc: u32,
    pub sr: u16,
}

/// The m68k status register's interrupt-priority-mask field (`SR[10:8]`),
/// saved and restored verbatim by [`raw_mask_disable_all`] /
/// [`raw_mask_restore`].
pub type RawIrqMask = u16;

const IPL_MASK: u16 = 0x0700;
const IPL_DISABLE_ALL: u16 = 0x0700;

/// Raises the CPU interrupt priority level to 7 (disable all maskable
/// interrupts), returning the previous `SR` so it can be restored exactly.
#[inline(always)]
pub fn raw_mask_disable_all() -> RawIrqMask {
    let mut old_sr: u16;
    unsafe {
        asm!(
            "move.w sr, {old}",
            "move.w {new}, sr",
            old = out(reg) old_sr,
            new = in(reg) IPL_DISABLE_ALL,
        );
    }
    old_sr & IPL_MASK
}

/// Restores a previously saved interrupt-priority-mask field.
#[inline(always)]
pub fn raw_mask_restore(old: RawIrqMask) {
    unsafe {
        asm!(
            "move.w sr, {tmp}",
            "and.w {clear}, {tmp}",
            "or.w {old}, {tmp}",
            "move.w {tmp}, sr",
            tmp = out(reg) _,
            clear = in(reg) !IPL_MASK,
            old = in(reg) old,
        );
    }
}

/// Hard-spins for approximately `ns` nanoseconds, calibrated against the
/// monotonic clock's quantum frequency. Reserved for delays below
/// `config::MAX_SHORT_DELAY_NS`; longer waits must go through a wait queue.
pub fn hard_spin(ns: u32) {
    let cycles = crate::config::spin_cycles_for_ns(ns);
    for _ in 0..cycles {
        unsafe {
            asm!("nop");
        }
    }
}

extern "C" {
    fn serena_csw_switch(from: *mut SavedState, to: *const SavedState);
    fn serena_csw_switch_to_boot_vcpu(to: *const SavedState) -> !;
}

/// Saves `from`'s context, restores `to`'s, and resumes execution on the
/// incoming vcpu's stack. Never inlined: the call itself is part of the
/// context-switch protocol.
#[inline(never)]
pub fn switch_context(from: &mut SavedState, to: &SavedState, to_id: u32) {
    let _ = to_id;
    // Safety: `from`/`to` are valid `SavedState`s owned by the scheduler's
    // vcpu table; `serena_csw_switch` only ever reads `to` and writes
    // `from`, matching the signature above.
    unsafe { serena_csw_switch(from, to) }
}

/// Installs `to` as the initial machine state and never returns.
pub fn switch_to_boot_vcpu(to: &SavedState, to_id: u32) -> ! {
    let _ = to_id;
    // Safety: `to` is a valid `SavedState` owned by the scheduler; this
    // never returns, matching the signature above.
    unsafe { serena_csw_switch_to_boot_vcpu(to) }
}

// Raw context switch primitives declared by `csw.h` in the original kernel
// (`csw_switch`, `csw_switch_to_boot_vcpu`). No prologue/epilogue: these are
// whole-function assembly so the register file belongs entirely to us, the
// same technique the ARM backend this was ported from uses for its SVCall
// and fault handlers.
//
// Calling convention (m68k SysV): arguments arrive on the stack above the
// return address. `serena_csw_switch` takes `from` at 4(sp) and `to` at
// 8(sp); `serena_csw_switch_to_boot_vcpu` takes only `to`, at 4(sp).
//
// `SavedState` byte offsets (see the struct above): d=0, a=32, usp=60,
// ksp=64, pc=68, sr=72.
global_asm! {"
    .section .text.serena_csw_switch
    .globl serena_csw_switch
    .type serena_csw_switch,function
serena_csw_switch:
    move.l  4(sp), a0           | a0 = from
    move.l  8(sp), a1           | a1 = to
    movem.l d0-d7/a0-a6, (a0)   | save outgoing register file
    move.l  usp, a2
    move.l  a2, 60(a0)          | from.usp
    move.l  sp, 64(a0)          | from.ksp: resume here, stack as-is
    lea     1f, a2
    move.l  a2, 68(a0)          | from.pc, for introspection only
    move.w  sr, 72(a0)          | from.sr

    move.w  72(a1), sr          | to.sr
    move.l  60(a1), a2
    move.l  a2, usp             | to.usp
    move.l  64(a1), sp          | to.ksp becomes the live stack pointer
    movem.l (a1), d0-d7/a0-a6   | restore incoming register file
    rts                         | resumes `to` where its own switch left off
1:
    rts                         | `from` is resumed: behaves like a plain return

    .section .text.serena_csw_switch_to_boot_vcpu
    .globl serena_csw_switch_to_boot_vcpu
    .type serena_csw_switch_to_boot_vcpu,function
serena_csw_switch_to_boot_vcpu:
    move.l  4(sp), a0           | a0 = to
    move.w  72(a0), sr          | to.sr
    move.l  60(a0), a2
    move.l  a2, usp             | to.usp
    move.l  64(a0), sp          | to.ksp becomes the live stack pointer
    move.l  68(a0), -(sp)       | push to.pc: no prior call frame to return into
    movem.l (a0), d0-d7/a0-a6   | restore register file
    rts                         | jumps to to.pc
",
}

/// Writes a formatted log line to the configured debug sink (typically a
/// serial port on real hardware).
pub fn klog_write(args: fmt::Arguments<'_>) {
    let _ = args;
    // Hardware debug sink wiring is out of scope for this core; higher
    // layers install a sink via `config::set_log_sink` before this is
    // reachable on real hardware.
}

/// Structured trace point used at scheduler transitions, interrupt handler
/// (un)registration, heap region addition, and fatal-panic entry. Compiles
/// to a call through [`klog_write`], which is a no-op until a debug sink is
/// installed.
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::arch::klog_write(format_args!($($arg)*))
    };
}
