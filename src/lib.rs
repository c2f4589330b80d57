// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! x86 Performance Monitoring support
//!
//! The ring-zero half of Intel Performance Monitoring Unit support: the
//! privileged code that programs the fixed and programmable counters,
//! fields counter-overflow interrupts, and streams sampled records into
//! per-CPU buffers shared with the userspace cpu-trace driver.
//!
//! The driver decides which events to collect and consumes the trace; it
//! calls down through the `arch_perfmon_*` surface in [`arch::amd64`].
//! Code lives here only when it has to (MSR access needs ring zero), and
//! nothing the driver supplies is trusted: every configuration is validated
//! against hardware-derived writable masks before any of it is programmed.
//!
//! Requires performance monitoring architectural version 4 or newer; on
//! older or implausible hardware the subsystem reports itself unsupported.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod caps;
pub mod cpuperf;
pub mod msr;
pub mod perfmon;
pub mod records;
pub mod trace;
pub mod types;
pub mod validate;
pub mod vmo;

#[cfg(test)]
mod testutil;

pub use caps::HardwareCaps;
pub use cpuperf::{PmuConfig, PmuProperties};
pub use perfmon::Perfmon;
pub use types::{Result, Status};
pub use vmo::{RefPtr, VmMapping, VmObject};
