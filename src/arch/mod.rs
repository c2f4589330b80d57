// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Architecture Abstraction Layer for the perfmon subsystem
//!
//! The perfmon core drives hardware and the surrounding kernel exclusively
//! through [`PerfmonHw`]. The x86-64 backend in [`amd64`] supplies the MSR
//! and timestamp primitives directly and routes the kernel-facade pieces
//! (APIC, cross-CPU broadcast, platform clock) to hooks the embedding kernel
//! installs at boot. Tests drive the core with a fake machine instead.

use crate::types::CpuId;

pub mod amd64;

/// One CPUID leaf's worth of registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuidLeaf {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
}

/// Interrupt handler disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerReturn {
    /// Return to the interrupted context.
    NoReschedule,
    /// Ask the scheduler to run.
    Reschedule,
}

/// Hardware and kernel services consumed by the perfmon core.
///
/// MSR accesses always target the calling CPU. Counter-MSR writes are only
/// issued from broadcast tasks and the PMI handler, both of which run with
/// interrupts disabled on the CPU that owns the registers.
pub trait PerfmonHw: Send + Sync {
    /// Number of CPU slots to allocate; CPUs are numbered `0..max`.
    fn max_num_cpus(&self) -> CpuId;

    /// The CPU this code is running on.
    fn curr_cpu_num(&self) -> CpuId;

    /// Query a CPUID leaf, or `None` if the leaf is not implemented.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Option<CpuidLeaf>;

    /// Read an MSR on the calling CPU.
    fn read_msr(&self, msr: u32) -> u64;

    /// Write an MSR on the calling CPU.
    fn write_msr(&self, msr: u32, value: u64);

    /// Read the time-stamp counter.
    fn rdtsc(&self) -> u64;

    /// Read CR3 (the interrupted address space, from PMI context).
    fn read_cr3(&self) -> u64;

    /// Rate of [`PerfmonHw::rdtsc`] timestamps.
    fn ticks_per_second(&self) -> u64;

    /// Run `task` on every CPU with interrupts disabled, passing each CPU
    /// its number. Returns once all CPUs have completed.
    fn sync_exec(&self, task: &(dyn Fn(CpuId) + Sync));

    /// Mask the PMI vector on the local APIC.
    fn apic_pmi_mask(&self);

    /// Unmask the PMI vector on the local APIC.
    fn apic_pmi_unmask(&self);

    /// Issue end-of-interrupt on the local APIC.
    fn apic_issue_eoi(&self);
}
