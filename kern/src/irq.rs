// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt dispatch layer.
//!
//! One inline "direct" handler per source (for low-latency sources like the
//! quantum timer) and, for everything else, a priority-ordered chain of
//! handlers a driver can add to and remove from at start/stop. All
//! bookkeeping lives behind one spinlock, matching the "interrupt
//! controller's chains use one spinlock" resource model; dispatch itself
//! (walking the chain, invoking handlers) runs with that spinlock already
//! released, since a handler must be free to touch unrelated kernel state.

use abi::InterruptStat;
use heapless::Vec as HVec;

use crate::arch;
use crate::config::{IRQ_SOURCE_COUNT, MAX_HANDLERS_PER_SOURCE};
use crate::spinlock::Spinlock;

/// Previous CPU interrupt mask, returned by [`set_mask`] for [`restore_mask`]
/// to hand back exactly.
pub type Mask = arch::RawIrqMask;

/// Raises the CPU to fully masked and returns the previous mask. This core's
/// arch backends model only one mask level (everything on or everything
/// off); `set_mask`/`restore_mask` exist as a nesting-safe pair so callers
/// don't need to know that.
pub fn set_mask() -> Mask {
    arch::raw_mask_disable_all()
}

/// Restores a mask previously returned by [`set_mask`].
pub fn restore_mask(old: Mask) {
    arch::raw_mask_restore(old)
}

/// A low-latency handler installed with [`set_direct_handler`]. Runs inline
/// on the interrupt stack; must not block.
pub type DirectHandlerFn = fn(arg: usize);

/// A chained handler installed with [`add_handler`]. Returns `true` if it
/// consumed the interrupt, stopping the chain walk.
pub type HandlerFn = fn(arg: usize) -> bool;

/// One entry in a source's priority-ordered handler chain.
#[derive(Clone, Copy)]
pub struct Handler {
    pub id: u32,
    pub priority: i8,
    pub enabled: bool,
    func: HandlerFn,
    arg: usize,
}

impl Handler {
    pub fn new(id: u32, priority: i8, func: HandlerFn, arg: usize) -> Self {
        Handler {
            id,
            priority,
            enabled: true,
            func,
            arg,
        }
    }
}

struct Source {
    master_enabled: bool,
    direct: Option<(DirectHandlerFn, usize)>,
    chain: HVec<Handler, MAX_HANDLERS_PER_SOURCE>,
}

impl Source {
    const fn new() -> Self {
        Source {
            master_enabled: false,
            direct: None,
            chain: HVec::new(),
        }
    }
}

struct State {
    sources: [Source; IRQ_SOURCE_COUNT],
    spurious: u32,
    uninitialized: u32,
    non_maskable: u32,
}

/// The interrupt controller: per-source enable state, handler chains, and
/// spurious/uninitialized/non-maskable failure counters.
pub struct InterruptController {
    state: Spinlock<State>,
}

impl InterruptController {
    pub fn new() -> Self {
        InterruptController {
            state: Spinlock::new(State {
                sources: core::array::from_fn(|_| Source::new()),
                spurious: 0,
                uninitialized: 0,
                non_maskable: 0,
            }),
        }
    }

    /// Enables dispatch for `src`. Idempotent; also flips the source's
    /// master switch on, since a disabled source never reaches a handler
    /// regardless of handler-level enable state.
    pub fn enable_src(&self, src: usize) {
        self.state.lock().sources[src].master_enabled = true;
    }

    pub fn disable_src(&self, src: usize) {
        self.state.lock().sources[src].master_enabled = false;
    }

    /// Installs `func` as the single inline handler for `src`, replacing
    /// any previous direct handler. Meant for sources dispatched too often
    /// to afford chain-walk overhead (the clock tick).
    pub fn set_direct_handler(&self, src: usize, func: DirectHandlerFn, arg: usize) {
        let mut state = self.state.lock();
        state.sources[src].direct = Some((func, arg));
        state.sources[src].master_enabled = true;
    }

    pub fn clear_direct_handler(&self, src: usize) {
        self.state.lock().sources[src].direct = None;
    }

    /// Inserts `h` into `src`'s chain, keeping it sorted by ascending
    /// priority. Fails silently (drops the handler) if the chain is already
    /// at [`MAX_HANDLERS_PER_SOURCE`]; the design treats handler-chain
    /// registration as a boot/driver-start-time operation sized well within
    /// that bound, so this is a configuration error rather than a runtime
    /// condition callers need to check for.
    pub fn add_handler(&self, src: usize, h: Handler) {
        klog!("irq: add handler {} on source {}", h.id, src);
        let mut state = self.state.lock();
        let chain = &mut state.sources[src].chain;
        let pos = chain
            .iter()
            .position(|existing| existing.priority > h.priority)
            .unwrap_or(chain.len());
        let _ = chain.insert(pos, h);
        state.sources[src].master_enabled = true;
    }

    pub fn remove_handler(&self, src: usize, id: u32) {
        let mut state = self.state.lock();
        let chain = &mut state.sources[src].chain;
        if let Some(pos) = chain.iter().position(|h| h.id == id) {
            chain.remove(pos);
            klog!("irq: remove handler {} on source {}", id, src);
        }
    }

    pub fn set_handler_enabled(&self, src: usize, id: u32, enabled: bool) {
        let mut state = self.state.lock();
        if let Some(h) = state.sources[src].chain.iter_mut().find(|h| h.id == id) {
            h.enabled = enabled;
        }
    }

    /// Dispatches an interrupt from `src`. Called from the exception entry
    /// stub with the source's mask already raised. Runs the direct handler
    /// if one is installed, otherwise walks the chain in ascending priority
    /// until a handler returns `true`. A source that is disabled, or has no
    /// handler at all, counts as spurious.
    pub fn dispatch(&self, src: usize) {
        if src >= IRQ_SOURCE_COUNT {
            self.state.lock().spurious += 1;
            return;
        }

        // Snapshot what to run while holding the lock, then run handlers
        // with it released: handlers may take other locks or wake wait
        // queues, and the chain spinlock must stay a leaf lock.
        let (direct, chain, enabled) = {
            let state = self.state.lock();
            let s = &state.sources[src];
            (s.direct, s.chain.clone(), s.master_enabled)
        };

        if !enabled {
            self.state.lock().spurious += 1;
            return;
        }

        if let Some((func, arg)) = direct {
            func(arg);
            return;
        }

        let mut consumed = false;
        for h in chain.iter().filter(|h| h.enabled) {
            if (h.func)(h.arg) {
                consumed = true;
                break;
            }
        }
        if !consumed {
            self.state.lock().spurious += 1;
        }
    }

    pub fn note_uninitialized(&self) {
        self.state.lock().uninitialized += 1;
    }

    pub fn note_non_maskable(&self) {
        self.state.lock().non_maskable += 1;
    }

    pub fn get_stat(&self, kind: InterruptStat) -> u32 {
        let state = self.state.lock();
        match kind {
            InterruptStat::Spurious => state.spurious,
            InterruptStat::Uninitialized => state.uninitialized,
            InterruptStat::NonMaskable => state.non_maskable,
        }
    }
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static CALLS: AtomicU32 = AtomicU32::new(0);

    fn bump(_arg: usize) -> bool {
        CALLS.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn ignore(_arg: usize) -> bool {
        false
    }

    #[test]
    fn disabled_source_counts_spurious() {
        let ic = InterruptController::new();
        ic.dispatch(3);
        assert_eq!(ic.get_stat(InterruptStat::Spurious), 1);
    }

    #[test]
    fn direct_handler_short_circuits_chain() {
        let ic = InterruptController::new();
        ic.set_direct_handler(5, |_| {}, 0);
        ic.add_handler(5, Handler::new(1, 0, bump, 0));
        ic.dispatch(5);
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn chain_walks_ascending_priority_until_consumed() {
        let ic = InterruptController::new();
        ic.add_handler(7, Handler::new(1, 10, ignore, 0));
        ic.add_handler(7, Handler::new(2, 0, ignore, 0));
        ic.add_handler(7, Handler::new(3, 5, bump, 0));
        let before = CALLS.load(Ordering::SeqCst);
        ic.dispatch(7);
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 1);
        assert_eq!(ic.get_stat(InterruptStat::Spurious), 0);
    }

    #[test]
    fn uninstalled_chain_is_spurious() {
        let ic = InterruptController::new();
        ic.enable_src(9);
        ic.dispatch(9);
        assert_eq!(ic.get_stat(InterruptStat::Spurious), 1);
    }

    #[test]
    fn remove_handler_drops_it_from_chain() {
        let ic = InterruptController::new();
        ic.add_handler(2, Handler::new(1, 0, bump, 0));
        ic.remove_handler(2, 1);
        ic.dispatch(2);
        assert_eq!(ic.get_stat(InterruptStat::Spurious), 1);
    }
}
