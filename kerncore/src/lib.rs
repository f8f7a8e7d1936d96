// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

/// Describes types that act as an address range (base/length pair) without
/// committing to how the range is actually stored.
///
/// # Invariants
///
/// `r.is_empty()` implies `r.base_addr() == r.end_addr()`, and vice versa.
///
/// `r.base_addr() <= r.end_addr()` must hold.
pub trait AddrRange {
    /// Whether this range spans zero bytes.
    fn is_empty(&self) -> bool;

    /// The address of the first byte included in this range.
    fn base_addr(&self) -> usize;

    /// The address of the first byte *not* included in this range, past the
    /// end.
    fn end_addr(&self) -> usize;
}

impl<T: AddrRange> AddrRange for &T {
    #[inline(always)]
    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Describes types that act as a region descriptor: an address range plus
/// whatever attributes the caller wants to check via a predicate.
///
/// This is almost identical to [`AddrRange`] but kept as a separate trait so
/// that region tables and the ranges checked against them can be different
/// concrete types.
///
/// # Invariants
///
/// `r.contains(x)` implies `r.base_addr() <= x < r.end_addr()` and vice
/// versa.
///
/// By extension, `r.base_addr() <= r.end_addr()` must hold. An empty region
/// is weird but not impossible.
pub trait Descriptor {
    fn contains(&self, addr: usize) -> bool;
    fn base_addr(&self) -> usize;
    fn end_addr(&self) -> usize;
}

impl<T: Descriptor> Descriptor for &T {
    #[inline(always)]
    fn contains(&self, addr: usize) -> bool {
        (**self).contains(addr)
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Generic coverage check: is `range` entirely covered by one or more
/// descriptors in `table` that satisfy `region_ok`?
///
/// This is the algorithm the heap allocator uses to decide whether a freed
/// or allocated block lies within a region that satisfies
/// `AllocOptions::UNIFIED`: the region table there is the set of registered
/// memory descriptors, and `region_ok` tests `kind`.
///
/// The exact representation of the range type `S` and the descriptor type
/// `R` are left unspecified, to avoid this crate depending on allocator- or
/// arch-internal types. The requirements are given by [`AddrRange`] and
/// [`Descriptor`] respectively.
///
/// # Preconditions
///
/// `table` must be sorted by base address, and its entries must not
/// overlap.
///
/// # Returns
///
/// `true` if `range` is completely covered by one or more contiguous
/// descriptors in `table` that meet `region_ok`.
pub fn is_covered_by<S, R>(
    range: S,
    table: &[R],
    region_ok: impl Fn(&R) -> bool,
) -> bool
where
    S: AddrRange,
    R: Descriptor,
{
    if range.is_empty() {
        // An empty range is trivially covered: it claims no bytes, so there's
        // nothing to check it against.
        return true;
    }

    // table is sorted by base address and non-overlapping, so a single pass
    // suffices.
    let start_addr = range.base_addr();
    let end_addr = range.end_addr();

    let mut i = 0;
    for region in table {
        if region.contains(start_addr) {
            if !region_ok(region) {
                return false;
            }

            if end_addr <= region.end_addr() {
                return true;
            }

            // Found the start region; it doesn't reach end_addr, so look for
            // the rest starting at the next entry.
            i += 1;
            break;
        }
        if region.base_addr() > end_addr {
            // Passed the target address without finding a covering region.
            return false;
        }
        i += 1;
    }

    for region in &table[i..] {
        if !region_ok(region) {
            break;
        }

        if end_addr <= region.end_addr() {
            return true;
        }
    }

    false
}
