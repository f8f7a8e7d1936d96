// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate
//! that concern using `Result`.
//!
//! [`abi::KernError`] is re-exported as [`KernError`] so call sites can
//! write `err::KernError` without reaching into the ABI crate directly; it's
//! the one error type every fallible operation in this core returns.
//! Conditions the design treats as fatal kernel bugs (unlock by a
//! non-owner, `deinit` of a non-empty queue from inside a sync primitive,
//! double free, freeing a foreign pointer, preemption-disable underflow)
//! never reach this type — they call [`crate::fail::die`] instead.

pub use abi::KernError;

/// Shorthand for the `Result` type every fallible kernel operation returns.
pub type KernResult<T> = Result<T, KernError>;
