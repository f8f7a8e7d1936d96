// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel execution substrate.
//!
//! This crate is the application-independent core of the system: the heap
//! allocator, the interrupt dispatch layer, the monotonic clock, wait
//! queues, the virtual-processor scheduler, and the synchronization
//! primitives built on top of it. Everything above this layer (filesystems,
//! device drivers, process/executable loading, the system call surface) is
//! a client of these primitives; none of that lives here.
//!
//! # Design principles
//!
//! 1. One build-time-fixed shape. Table sizes ([`config::MAX_VCPUS`], the
//!    QoS class/sub-priority grid, the interrupt source count) are compile
//!    time constants rather than runtime configuration, except where the
//!    shape genuinely isn't known until boot (the heap's region table).
//! 2. No heap allocation on the scheduling or interrupt-dispatch hot paths.
//!    Ready queues, wait queues, and IRQ handler chains are either intrusive
//!    lists threaded through the objects they hold, or fixed-capacity
//!    tables.
//! 3. A strong preference for safe code. `unsafe` is confined to the
//!    architecture backend, the heap's raw block headers, and the intrusive
//!    list links.
//! 4. Spinlocks are leaf locks. Nothing in this crate nests one spinlock
//!    inside another; the heap, wait queues, the ready set, and the
//!    interrupt chains each hold exactly one.

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod arch;

pub mod clock;
pub mod config;
pub mod err;
pub mod fail;
pub mod heap;
pub mod intrusive;
pub mod irq;
pub mod preempt;
pub mod sched;
pub mod spinlock;
pub mod sync;
pub mod vcpu;
pub mod waitqueue;
