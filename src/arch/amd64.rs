// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! x86-64 backend
//!
//! The instruction-level primitives the perfmon core needs (`rdmsr`,
//! `wrmsr`, `rdtsc`, CR3, CPUID), the PMI interrupt frame, and the boot
//! wiring: a [`X86PerfmonHw`] backend whose kernel-facade pieces come from
//! [`X86PerfmonHooks`] installed once at boot, plus the `arch_perfmon_*`
//! entry points the syscall layer and the PMI vector call into.

use crate::arch::{CpuidLeaf, HandlerReturn, PerfmonHw};
use crate::cpuperf::{PmuConfig, PmuProperties};
use crate::perfmon::Perfmon;
use crate::types::{CpuId, Result, ERR_NOT_SUPPORTED};
use crate::vmo::{RefPtr, VmObject};

/// Interrupt frame pushed for the PMI vector.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct X86Iframe {
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub vector: u64,
    pub err_code: u64,
    pub ip: u64,
    pub cs: u64,
    pub flags: u64,
    pub user_sp: u64,
    pub user_ss: u64,
}

/// Kernel services the perfmon backend is wired to at boot: the APIC
/// façade, the cross-CPU broadcast, and the platform clock.
#[derive(Clone, Copy)]
pub struct X86PerfmonHooks {
    /// `arch_max_num_cpus`.
    pub max_num_cpus: fn() -> CpuId,

    /// `arch_curr_cpu_num`.
    pub curr_cpu_num: fn() -> CpuId,

    /// Rate of the time-stamp counter.
    pub ticks_per_second: fn() -> u64,

    /// `mp_sync_exec` over all CPUs: run the task everywhere with
    /// interrupts disabled and wait for completion.
    pub sync_exec: fn(task: &(dyn Fn(CpuId) + Sync)),

    /// Mask the PMI vector in the local APIC LVT.
    pub apic_pmi_mask: fn(),

    /// Unmask the PMI vector in the local APIC LVT.
    pub apic_pmi_unmask: fn(),

    /// Issue end-of-interrupt on the local APIC.
    pub apic_issue_eoi: fn(),
}

/// ============================================================================
/// Instruction wrappers
/// ============================================================================

/// Read a 64-bit MSR.
///
/// # Safety
///
/// `msr` must be a valid MSR for the current CPU.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn rdmsr(msr: u32) -> u64 {
    let (low, high): (u32, u32);
    core::arch::asm!(
        "rdmsr",
        in("ecx") msr,
        lateout("eax") low,
        lateout("edx") high,
        options(nomem, nostack)
    );
    ((high as u64) << 32) | (low as u64)
}

/// Write a 64-bit MSR.
///
/// # Safety
///
/// `msr` must be a valid writable MSR for the current CPU and `value` a
/// legal value for it.
#[cfg(target_arch = "x86_64")]
#[inline]
pub unsafe fn wrmsr(msr: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    core::arch::asm!(
        "wrmsr",
        in("ecx") msr,
        in("eax") low,
        in("edx") high,
        options(nostack)
    );
}

/// Read the TSC (Time Stamp Counter).
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn rdtsc() -> u64 {
    unsafe {
        let (low, high): (u32, u32);
        core::arch::asm!("rdtsc", lateout("eax") low, lateout("edx") high, options(nomem, nostack));
        ((high as u64) << 32) | (low as u64)
    }
}

/// Read CR3 (Page Directory Base Register).
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn x86_get_cr3() -> u64 {
    unsafe {
        let cr3: u64;
        core::arch::asm!("mov {0}, cr3", out(reg) cr3, options(nomem, nostack));
        cr3
    }
}

/// ============================================================================
/// Hardware backend
/// ============================================================================

/// The real machine: instruction primitives plus the boot-installed hooks.
#[cfg(target_arch = "x86_64")]
pub struct X86PerfmonHw {
    hooks: X86PerfmonHooks,
}

#[cfg(target_arch = "x86_64")]
impl X86PerfmonHw {
    pub fn new(hooks: X86PerfmonHooks) -> Self {
        Self { hooks }
    }
}

#[cfg(target_arch = "x86_64")]
impl PerfmonHw for X86PerfmonHw {
    fn max_num_cpus(&self) -> CpuId {
        (self.hooks.max_num_cpus)()
    }

    fn curr_cpu_num(&self) -> CpuId {
        (self.hooks.curr_cpu_num)()
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> Option<CpuidLeaf> {
        let max_leaf = raw_cpuid::cpuid!(0x0).eax;
        if leaf > max_leaf {
            return None;
        }
        let result = raw_cpuid::cpuid!(leaf, subleaf);
        Some(CpuidLeaf {
            a: result.eax,
            b: result.ebx,
            c: result.ecx,
            d: result.edx,
        })
    }

    fn read_msr(&self, msr: u32) -> u64 {
        // The core only reads MSRs enumerated by the capability probe.
        unsafe { rdmsr(msr) }
    }

    fn write_msr(&self, msr: u32, value: u64) {
        // The core only writes probed MSRs with mask-validated values.
        unsafe { wrmsr(msr, value) }
    }

    fn rdtsc(&self) -> u64 {
        rdtsc()
    }

    fn read_cr3(&self) -> u64 {
        x86_get_cr3()
    }

    fn ticks_per_second(&self) -> u64 {
        (self.hooks.ticks_per_second)()
    }

    fn sync_exec(&self, task: &(dyn Fn(CpuId) + Sync)) {
        (self.hooks.sync_exec)(task)
    }

    fn apic_pmi_mask(&self) {
        (self.hooks.apic_pmi_mask)()
    }

    fn apic_pmi_unmask(&self) {
        (self.hooks.apic_pmi_unmask)()
    }

    fn apic_issue_eoi(&self) {
        (self.hooks.apic_issue_eoi)()
    }
}

/// ============================================================================
/// Boot wiring and kernel-facing entry points
/// ============================================================================

#[cfg(target_arch = "x86_64")]
static PERFMON: spin::Once<Perfmon<X86PerfmonHw>> = spin::Once::new();

/// Probe the hardware and stand up the perfmon subsystem.
///
/// Called once at boot, after the VM system and local APICs are up.
#[cfg(target_arch = "x86_64")]
pub fn x86_perfmon_init(hooks: X86PerfmonHooks) {
    PERFMON.call_once(|| Perfmon::new(X86PerfmonHw::new(hooks)));
}

#[cfg(target_arch = "x86_64")]
fn perfmon() -> Result<&'static Perfmon<X86PerfmonHw>> {
    PERFMON.get().ok_or(ERR_NOT_SUPPORTED)
}

/// Get the properties of the CPU's performance monitoring capabilities.
#[cfg(target_arch = "x86_64")]
pub fn arch_perfmon_get_properties() -> Result<PmuProperties> {
    perfmon()?.get_properties()
}

/// Initialize the performance monitoring session.
#[cfg(target_arch = "x86_64")]
pub fn arch_perfmon_init() -> Result {
    perfmon()?.init()
}

/// Assign a buffer for a CPU's performance monitoring data.
#[cfg(target_arch = "x86_64")]
pub fn arch_perfmon_assign_buffer(cpu: CpuId, vmo: RefPtr<dyn VmObject>) -> Result {
    perfmon()?.assign_buffer(cpu, vmo)
}

/// Stage a performance monitoring configuration.
#[cfg(target_arch = "x86_64")]
pub fn arch_perfmon_stage_config(config: &PmuConfig) -> Result {
    perfmon()?.stage_config(config)
}

/// Start performance monitoring with the staged configuration.
#[cfg(target_arch = "x86_64")]
pub fn arch_perfmon_start() -> Result {
    perfmon()?.start()
}

/// Stop performance monitoring.
#[cfg(target_arch = "x86_64")]
pub fn arch_perfmon_stop() -> Result {
    perfmon()?.stop()
}

/// Clean up and finalize the performance monitoring session.
#[cfg(target_arch = "x86_64")]
pub fn arch_perfmon_fini() -> Result {
    perfmon()?.fini()
}

/// Handle a Performance Monitoring Interrupt.
///
/// Called from the PMI vector stub with interrupts disabled.
#[cfg(target_arch = "x86_64")]
pub fn apic_pmi_interrupt_handler(frame: &X86Iframe) -> HandlerReturn {
    match PERFMON.get() {
        Some(perfmon) => perfmon.handle_pmi(frame),
        None => HandlerReturn::NoReschedule,
    }
}
