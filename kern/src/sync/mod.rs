// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization primitives built on top of [`crate::waitqueue`]: a mutex,
//! a counting semaphore, and a condition variable, each a thin layer over a
//! wait queue plus whatever atomic state word and spinlock its own
//! bookkeeping needs.

pub mod condvar;
pub mod mutex;
pub mod sem;

pub use condvar::Condvar;
pub use mutex::Mutex;
pub use sem::Semaphore;
