// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive doubly-linked FIFO threaded through vcpu records.
//!
//! Ready queues and wait queues both need a FIFO of vcpus without heap
//! allocation at dispatch time. Rather than give each of the roughly one
//! hundred ready-queue slots (six QoS classes times sixteen sub-priorities)
//! and every wait queue its own fixed-capacity buffer, membership is
//! threaded through the `next`/`prev` fields already on [`crate::vcpu::Vcpu`]
//! (`link`, `invariant`: a vcpu sits on at most one such list at a time).

use crate::vcpu::{VcpuId, VcpuTable};

/// FIFO of vcpu ids, threaded through the vcpu table rather than owning any
/// storage of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntrusiveQueue {
    head: Option<VcpuId>,
    tail: Option<VcpuId>,
}

impl IntrusiveQueue {
    pub const fn new() -> Self {
        IntrusiveQueue {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn front(&self) -> Option<VcpuId> {
        self.head
    }

    /// Appends `id` to the tail. `id` must not already be linked on any
    /// queue.
    pub fn push_back(&mut self, table: &mut VcpuTable, id: VcpuId) {
        table.set_link(id, self.tail, None);
        if let Some(old_tail) = self.tail {
            table.set_next(old_tail, Some(id));
        } else {
            self.head = Some(id);
        }
        self.tail = Some(id);
    }

    /// Removes and returns the head of the queue, if any.
    pub fn pop_front(&mut self, table: &mut VcpuTable) -> Option<VcpuId> {
        let id = self.head?;
        self.remove(table, id);
        Some(id)
    }

    /// Removes `id` from this queue. The caller must know `id` is actually a
    /// member; this only repairs the surrounding links and this queue's
    /// head/tail.
    pub fn remove(&mut self, table: &mut VcpuTable, id: VcpuId) {
        let (prev, next) = table.link_of(id);
        match prev {
            Some(p) => table.set_next(p, next),
            None => self.head = next,
        }
        match next {
            Some(n) => table.set_prev(n, prev),
            None => self.tail = prev,
        }
        table.clear_link(id);
    }

    pub fn iter<'a>(&'a self, table: &'a VcpuTable) -> Iter<'a> {
        Iter {
            table,
            next: self.head,
        }
    }
}

pub struct Iter<'a> {
    table: &'a VcpuTable,
    next: Option<VcpuId>,
}

impl Iterator for Iter<'_> {
    type Item = VcpuId;

    fn next(&mut self) -> Option<VcpuId> {
        let id = self.next?;
        self.next = self.table.link_of(id).1;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcpu::VcpuTable;
    use abi::{Priority, QosClass};

    #[test]
    fn fifo_order_preserved() {
        let mut table = VcpuTable::new();
        let p = Priority::new(QosClass::Utility, 0);
        let ids: Vec<_> =
            (0..4).map(|_| table.acquire(p).unwrap()).collect();

        let mut q = IntrusiveQueue::new();
        for &id in &ids {
            q.push_back(&mut table, id);
        }

        let popped: Vec<_> =
            core::iter::from_fn(|| q.pop_front(&mut table)).collect();
        assert_eq!(popped, ids);
        assert!(q.is_empty());
    }

    #[test]
    fn remove_from_middle_preserves_remaining_order() {
        let mut table = VcpuTable::new();
        let p = Priority::new(QosClass::Utility, 0);
        let ids: Vec<_> =
            (0..3).map(|_| table.acquire(p).unwrap()).collect();

        let mut q = IntrusiveQueue::new();
        for &id in &ids {
            q.push_back(&mut table, id);
        }
        q.remove(&mut table, ids[1]);

        let remaining: Vec<_> = q.iter(&table).collect();
        assert_eq!(remaining, [ids[0], ids[2]]);
    }
}
