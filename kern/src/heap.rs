// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel heap: a bounded-region, first-fit block allocator.
//!
//! Regions are registered with [`Heap::add_region`] (at boot, and again
//! whenever expansion RAM is detected) and never removed. `alloc` picks the
//! first region whose [`abi::MemoryKind`] satisfies the request's options,
//! then first-fits a free block within that region, splitting off any
//! remainder large enough to carry its own header. `free` threads the block
//! back onto its region's free list and coalesces it with any
//! address-adjacent free neighbor.
//!
//! All state lives behind one spinlock, so every operation here completes
//! without blocking and may be called with interrupts disabled.

use core::mem::size_of;

use abi::{AllocOptions, KernError, MemoryDescriptor, MemoryKind};
use heapless::Vec as HVec;
use kerncore::{AddrRange, Descriptor};

use crate::config::{HEAP_ALIGN, MAX_MEMORY_DESCRIPTORS};
use crate::fail;
use crate::spinlock::Spinlock;

/// Header prefixed to every block, free or allocated. Free blocks thread
/// `next_free` through this header; allocated blocks ignore it.
#[repr(C)]
struct BlockHeader {
    size: usize,
    free: bool,
    region: u8,
    next_free: usize,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();
const MIN_BLOCK: usize = HEADER_SIZE + HEAP_ALIGN;

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

unsafe fn header_at(addr: usize) -> &'static mut BlockHeader {
    &mut *(addr as *mut BlockHeader)
}

struct Region {
    desc: MemoryDescriptor,
    free_head: usize,
}

impl Descriptor for Region {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.desc.lower && addr < self.desc.upper
    }

    fn base_addr(&self) -> usize {
        self.desc.lower
    }

    fn end_addr(&self) -> usize {
        self.desc.upper
    }
}

/// A byte range under test for region coverage, distinct from `Region`
/// itself so a single block's extent can be checked against the table.
struct ByteRange {
    base: usize,
    len: usize,
}

impl AddrRange for ByteRange {
    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        self.base + self.len
    }
}

struct State {
    regions: HVec<Region, MAX_MEMORY_DESCRIPTORS>,
}

impl State {
    fn add_region(&mut self, desc: MemoryDescriptor) -> Result<(), KernError> {
        if desc.is_empty() {
            return Ok(());
        }
        klog!(
            "heap: add region [{:#x}, {:#x}) kind={:?}",
            desc.lower,
            desc.upper,
            desc.kind
        );
        let region_idx = self.regions.len();
        if region_idx >= self.regions.capacity() {
            return Err(KernError::NoMemory);
        }
        let header = BlockHeader {
            size: desc.len(),
            free: true,
            region: region_idx as u8,
            next_free: 0,
        };
        unsafe {
            header_at(desc.lower).size = header.size;
            header_at(desc.lower).free = header.free;
            header_at(desc.lower).region = header.region;
            header_at(desc.lower).next_free = header.next_free;
        }
        self.regions
            .push(Region {
                desc,
                free_head: desc.lower,
            })
            .map_err(|_| KernError::NoMemory)
    }

    fn region_index_for(&self, addr: usize) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| addr >= r.desc.lower && addr < r.desc.upper)
    }

    fn alloc(&mut self, nbytes: usize, opts: AllocOptions) -> Result<*mut u8, KernError> {
        let need = align_up(nbytes, HEAP_ALIGN)
            .saturating_add(HEADER_SIZE)
            .max(MIN_BLOCK);
        for ridx in 0..self.regions.len() {
            if opts.contains(AllocOptions::UNIFIED)
                && !self.regions[ridx].desc.kind.satisfies_unified()
            {
                continue;
            }
            if let Some(block_addr) = self.alloc_from_region(ridx, need) {
                let ptr = (block_addr + HEADER_SIZE) as *mut u8;
                if opts.contains(AllocOptions::CLEAR) {
                    unsafe { core::ptr::write_bytes(ptr, 0, nbytes) };
                }
                return Ok(ptr);
            }
        }
        Err(KernError::NoMemory)
    }

    /// Walks the region's free list for the first block of at least `need`
    /// bytes (including the header), splitting off a remainder when one
    /// large enough to be its own block is left over.
    fn alloc_from_region(&mut self, ridx: usize, need: usize) -> Option<usize> {
        let mut prev = 0usize;
        let mut cur = self.regions[ridx].free_head;
        while cur != 0 {
            let hdr = unsafe { header_at(cur) };
            if hdr.size >= need {
                let next = hdr.next_free;
                let remainder = hdr.size - need;
                if remainder >= MIN_BLOCK {
                    let new_addr = cur + need;
                    let new_hdr = unsafe { header_at(new_addr) };
                    new_hdr.size = remainder;
                    new_hdr.free = true;
                    new_hdr.region = ridx as u8;
                    new_hdr.next_free = next;
                    hdr.size = need;
                    self.relink_free_head(ridx, prev, new_addr);
                } else {
                    self.relink_free_head(ridx, prev, next);
                }
                hdr.free = false;
                return Some(cur);
            }
            prev = cur;
            cur = hdr.next_free;
        }
        None
    }

    fn relink_free_head(&mut self, ridx: usize, prev: usize, replacement: usize) {
        if prev == 0 {
            self.regions[ridx].free_head = replacement;
        } else {
            unsafe { header_at(prev).next_free = replacement };
        }
    }

    /// Inserts `addr` into its region's free list in address order, which is
    /// what lets `coalesce` detect adjacency by comparing a block's extent
    /// against its immediate list neighbor rather than scanning the whole
    /// region.
    fn insert_free(&mut self, ridx: usize, addr: usize) {
        let mut prev = 0usize;
        let mut cur = self.regions[ridx].free_head;
        while cur != 0 && cur < addr {
            prev = cur;
            cur = unsafe { header_at(cur).next_free };
        }
        unsafe { header_at(addr).next_free = cur };
        if prev == 0 {
            self.regions[ridx].free_head = addr;
        } else {
            unsafe { header_at(prev).next_free = addr };
        }
    }

    fn coalesce(&mut self, ridx: usize) {
        let mut cur = self.regions[ridx].free_head;
        while cur != 0 {
            let (size, next) = {
                let hdr = unsafe { header_at(cur) };
                (hdr.size, hdr.next_free)
            };
            if next != 0 && cur + size == next {
                let (next_size, next_next) = {
                    let next_hdr = unsafe { header_at(next) };
                    (next_hdr.size, next_hdr.next_free)
                };
                let hdr = unsafe { header_at(cur) };
                hdr.size += next_size;
                hdr.next_free = next_next;
                // Don't advance: the merged block may reach its new
                // neighbor too.
            } else {
                cur = next;
            }
        }
    }

    fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let block_addr = (ptr as usize) - HEADER_SIZE;
        let ridx = match self.region_index_for(block_addr) {
            Some(i) => i,
            None => fail::die("heap: free of a pointer not owned by the allocator"),
        };
        let size = unsafe { header_at(block_addr) }.size;
        let range = ByteRange {
            base: block_addr,
            len: size,
        };
        if !kerncore::is_covered_by(range, core::slice::from_ref(&self.regions[ridx]), |_| true) {
            fail::die("heap: free of a pointer not owned by the allocator");
        }
        let hdr = unsafe { header_at(block_addr) };
        if hdr.free {
            fail::die("heap: double free");
        }
        hdr.free = true;
        self.insert_free(ridx, block_addr);
        self.coalesce(ridx);
    }

    fn size_of(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let block_addr = (ptr as usize) - HEADER_SIZE;
        let ridx = match self.region_index_for(block_addr) {
            Some(i) => i,
            None => fail::die("heap: size_of on a pointer not owned by the allocator"),
        };
        let size = unsafe { header_at(block_addr) }.size;
        let range = ByteRange {
            base: block_addr,
            len: size,
        };
        if !kerncore::is_covered_by(range, core::slice::from_ref(&self.regions[ridx]), |_| true) {
            fail::die("heap: size_of on a pointer not owned by the allocator");
        }
        size - HEADER_SIZE
    }
}

/// Process-wide kernel heap. One instance exists for the whole system; every
/// operation is guarded by a single spinlock.
pub struct Heap {
    state: Spinlock<State>,
}

impl Heap {
    pub const fn new() -> Self {
        Heap {
            state: Spinlock::new(State {
                regions: HVec::new(),
            }),
        }
    }

    /// Registers a new memory region with the heap. Regions are never
    /// removed once added.
    pub fn add_region(&self, desc: MemoryDescriptor) -> Result<(), KernError> {
        self.state.lock().add_region(desc)
    }

    pub fn alloc(&self, nbytes: usize, opts: AllocOptions) -> Result<*mut u8, KernError> {
        self.state.lock().alloc(nbytes, opts)
    }

    pub fn alloc_cleared(&self, nbytes: usize) -> Result<*mut u8, KernError> {
        self.alloc(nbytes, AllocOptions::CLEAR)
    }

    pub fn alloc_unified(&self, nbytes: usize) -> Result<*mut u8, KernError> {
        self.alloc(nbytes, AllocOptions::UNIFIED)
    }

    /// Frees a block previously returned by `alloc`. A no-op on a null
    /// pointer; fatal if `ptr` was not returned by this allocator or has
    /// already been freed.
    pub fn free(&self, ptr: *mut u8) {
        self.state.lock().free(ptr)
    }

    /// Gross size of the block backing `ptr`, which may exceed the size
    /// originally requested due to alignment and splitting thresholds.
    pub fn size_of(&self, ptr: *mut u8) -> usize {
        self.state.lock().size_of(ptr)
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(backing: &mut [u8], kind: MemoryKind) -> MemoryDescriptor {
        let lower = backing.as_mut_ptr() as usize;
        MemoryDescriptor {
            lower,
            upper: lower + backing.len(),
            kind,
        }
    }

    #[test]
    fn alloc_then_free_round_trips() {
        let mut backing = vec![0u8; 4096];
        let heap = Heap::new();
        heap.add_region(region(&mut backing, MemoryKind::Cpu)).unwrap();

        let p = heap.alloc(64, AllocOptions::empty()).unwrap();
        assert!(heap.size_of(p) >= 64);
        heap.free(p);
    }

    #[test]
    fn alloc_cleared_zeroes_the_block() {
        let mut backing = vec![0xAAu8; 4096];
        let heap = Heap::new();
        heap.add_region(region(&mut backing, MemoryKind::Cpu)).unwrap();

        let p = heap.alloc_cleared(32).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(p, 32) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn alloc_unified_skips_cpu_only_regions() {
        let mut cpu_region = vec![0u8; 4096];
        let mut unified_region = vec![0u8; 4096];
        let heap = Heap::new();
        heap.add_region(region(&mut cpu_region, MemoryKind::Cpu))
            .unwrap();
        heap.add_region(region(&mut unified_region, MemoryKind::Unified))
            .unwrap();

        let p = heap.alloc_unified(64).unwrap() as usize;
        let unified_base = unified_region.as_ptr() as usize;
        assert!(p >= unified_base && p < unified_base + unified_region.len());
    }

    #[test]
    fn exhausted_region_reports_no_memory() {
        let mut backing = vec![0u8; 64];
        let heap = Heap::new();
        heap.add_region(region(&mut backing, MemoryKind::Cpu)).unwrap();

        assert_eq!(heap.alloc(1_000_000, AllocOptions::empty()), Err(KernError::NoMemory));
    }

    #[test]
    fn free_then_alloc_reuses_coalesced_space() {
        let mut backing = vec![0u8; 4096];
        let heap = Heap::new();
        heap.add_region(region(&mut backing, MemoryKind::Cpu)).unwrap();

        let a = heap.alloc(100, AllocOptions::empty()).unwrap();
        let b = heap.alloc(100, AllocOptions::empty()).unwrap();
        heap.free(a);
        heap.free(b);
        // a and b's blocks should have coalesced back with the remainder of
        // the region into one free block big enough for a larger request.
        let c = heap.alloc(250, AllocOptions::empty()).unwrap();
        heap.free(c);
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        let heap = Heap::new();
        heap.free(core::ptr::null_mut());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let mut backing = vec![0u8; 4096];
        let heap = Heap::new();
        heap.add_region(region(&mut backing, MemoryKind::Cpu)).unwrap();

        let p = heap.alloc(32, AllocOptions::empty()).unwrap();
        heap.free(p);
        heap.free(p);
    }

    #[test]
    #[should_panic(expected = "not owned by the allocator")]
    fn free_of_foreign_pointer_is_fatal() {
        let heap = Heap::new();
        let mut stray = [0u8; 64];
        heap.free(stray.as_mut_ptr().wrapping_add(HEADER_SIZE));
    }
}
