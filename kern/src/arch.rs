// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names: [`SavedState`], `RawIrqMask`, `raw_mask_disable_all`,
//! `raw_mask_restore`, `hard_spin`, `switch_context`, `switch_to_boot_vcpu`,
//! and `klog_write`.

cfg_if::cfg_if! {
    if #[cfg(test)] {
        #[macro_use]
        pub mod sim;
        pub use sim::*;
    } else if #[cfg(target_arch = "m68k")] {
        #[macro_use]
        pub mod m68k;
        pub use m68k::*;
    } else {
        compile_error!(
            "support for this architecture not implemented (expected \
             m68k, or cfg(test) for the simulator)"
        );
    }
}
