// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Trace and Logging Support
//!
//! Kernel-style trace macros layered over the `log` facade. `TRACEF!` is
//! unconditional (diagnostics the operator should see); `LTRACEF!` is gated
//! on a per-module `LOCAL_TRACE` const, the way verbose tracing is toggled
//! per file in the rest of the kernel.

/// Unconditional diagnostic trace
#[macro_export]
macro_rules! TRACEF {
    ($($arg:tt)*) => {
        log::debug!(target: "perfmon", $($arg)*);
    };
}

/// Local (per-module) verbose trace
///
/// Expects a `LOCAL_TRACE: bool` const in the calling module.
#[macro_export]
macro_rules! LTRACEF {
    ($($arg:tt)*) => {
        if LOCAL_TRACE {
            log::trace!(target: "perfmon", $($arg)*);
        }
    };
}
