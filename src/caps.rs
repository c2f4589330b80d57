// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Hardware capability probe
//!
//! Runs once at boot: reads the performance monitoring CPUID leaf, sanity
//! checks what the hardware claims, and derives what the rest of the
//! subsystem works from: per-counter maxima, the overflow-status bits to
//! inspect on each PMI, and the MSR bits a userspace-supplied configuration
//! is allowed to set. Insane hardware answers leave the subsystem
//! unsupported rather than taking the kernel down.

use crate::arch::{CpuidLeaf, PerfmonHw};
use crate::cpuperf::{IPM_MAX_FIXED_COUNTERS, IPM_MAX_PROGRAMMABLE_COUNTERS};
use crate::msr::*;
use crate::TRACEF;

/// At a minimum we require Performance Monitoring version 4.
pub const MINIMUM_PERFMON_VERSION: u32 = 4;

/// Bits of IA32_DEBUGCTL a configuration may set.
///
/// Everything LBR/BTS-related stays off the list until those features are
/// supported. Freeze-on-PMI misbehaves on some parts, so it is opt-in at
/// build time.
pub const DEBUG_CTRL_WRITABLE_BITS: u64 = if cfg!(feature = "freeze-on-pmi") {
    IA32_DEBUGCTL_FREEZE_PERFMON_ON_PMI_MASK
} else {
    0
};

/// Bits of IA32_PERFEVTSELx a configuration may set.
pub const EVENT_SELECT_WRITABLE_BITS: u64 = IA32_PERFEVTSEL_EVENT_SELECT_MASK
    | IA32_PERFEVTSEL_UMASK_MASK
    | IA32_PERFEVTSEL_USR_MASK
    | IA32_PERFEVTSEL_OS_MASK
    | IA32_PERFEVTSEL_E_MASK
    | IA32_PERFEVTSEL_PC_MASK
    | IA32_PERFEVTSEL_INT_MASK
    | IA32_PERFEVTSEL_ANY_MASK
    | IA32_PERFEVTSEL_EN_MASK
    | IA32_PERFEVTSEL_INV_MASK
    | IA32_PERFEVTSEL_CMASK_MASK;

/// What the hardware can do, derived once at boot and immutable after.
#[derive(Debug, Clone)]
pub struct HardwareCaps {
    /// Performance monitor architectural version.
    pub version: u32,

    /// Counter counts and widths from cpuid.0AH.
    pub num_programmable: u32,
    pub num_fixed: u32,
    pub programmable_width: u32,
    pub fixed_width: u32,

    /// Maximum counter values, derived from the widths.
    pub max_programmable_value: u64,
    pub max_fixed_value: u64,

    /// Architectural events the hardware does NOT support (cpuid.0AH EBX).
    pub unsupported_events: u32,

    /// IA32_PERF_CAPABILITIES, or zero if the part lacks PDCM.
    pub capabilities: u32,

    /// Bits of IA32_PERF_GLOBAL_CTRL a configuration may set.
    pub global_ctrl_writable: u64,

    /// Bits of IA32_FIXED_CTR_CTRL a configuration may set.
    pub fixed_ctrl_writable: u64,

    /// Bits of IA32_DEBUGCTL a configuration may set.
    pub debug_ctrl_writable: u64,

    /// Bits of IA32_PERFEVTSELx a configuration may set.
    pub event_select_writable: u64,

    /// Counter overflow bits in GLOBAL_STATUS to check on each interrupt.
    pub counter_status_bits: u64,
}

impl HardwareCaps {
    /// Derive capabilities from the raw performance monitoring leaf.
    ///
    /// Returns `None` (leaving the subsystem unsupported) if the leaf
    /// reports something we cannot safely drive: counts beyond our
    /// compile-time maxima, counter widths outside [16, 64], or a
    /// performance monitor older than version 4.
    pub fn from_leaf(leaf: CpuidLeaf) -> Option<HardwareCaps> {
        let version = leaf.a & 0xff;
        if version < MINIMUM_PERFMON_VERSION {
            TRACEF!("perfmon: unsupported version {} in cpuid.0AH", version);
            return None;
        }

        let num_programmable = (leaf.a >> 8) & 0xff;
        if num_programmable as usize > IPM_MAX_PROGRAMMABLE_COUNTERS {
            TRACEF!(
                "perfmon: unexpected num programmable counters {} in cpuid.0AH",
                num_programmable
            );
            return None;
        }
        let programmable_width = (leaf.a >> 16) & 0xff;
        // The <16 test is just something simple to ensure it's usable.
        if !(16..=64).contains(&programmable_width) {
            TRACEF!(
                "perfmon: unexpected programmable counter width {} in cpuid.0AH",
                programmable_width
            );
            return None;
        }

        let ebx_length = (leaf.a >> 24) & 0xff;
        if ebx_length > 7 {
            TRACEF!("perfmon: unexpected value {} in cpuid.0AH.EAX[31..24]", ebx_length);
            return None;
        }
        let unsupported_events = leaf.b & ((1u32 << ebx_length) - 1);

        let num_fixed = leaf.d & 0x1f;
        if num_fixed as usize > IPM_MAX_FIXED_COUNTERS {
            TRACEF!("perfmon: unexpected num fixed counters {} in cpuid.0AH", num_fixed);
            return None;
        }
        let fixed_width = (leaf.d >> 5) & 0xff;
        if !(16..=64).contains(&fixed_width) {
            TRACEF!(
                "perfmon: unexpected fixed counter width {} in cpuid.0AH",
                fixed_width
            );
            return None;
        }

        let mut counter_status_bits = 0;
        for i in 0..num_programmable {
            counter_status_bits |= ia32_perf_global_status_pmc_ovf_mask(i);
        }
        for i in 0..num_fixed {
            counter_status_bits |= ia32_perf_global_status_fixed_ovf_mask(i);
        }

        let mut global_ctrl_writable = 0;
        for i in 0..num_programmable {
            global_ctrl_writable |= ia32_perf_global_ctrl_pmc_en_mask(i);
        }
        for i in 0..num_fixed {
            global_ctrl_writable |= ia32_perf_global_ctrl_fixed_en_mask(i);
        }

        let mut fixed_ctrl_writable = 0;
        for i in 0..num_fixed {
            fixed_ctrl_writable |= ia32_fixed_ctr_ctrl_en_mask(i);
            fixed_ctrl_writable |= ia32_fixed_ctr_ctrl_any_mask(i);
            fixed_ctrl_writable |= ia32_fixed_ctr_ctrl_pmi_mask(i);
        }

        Some(HardwareCaps {
            version,
            num_programmable,
            num_fixed,
            programmable_width,
            fixed_width,
            max_programmable_value: max_counter_value(programmable_width),
            max_fixed_value: max_counter_value(fixed_width),
            unsupported_events,
            capabilities: 0,
            global_ctrl_writable,
            fixed_ctrl_writable,
            debug_ctrl_writable: DEBUG_CTRL_WRITABLE_BITS,
            event_select_writable: EVENT_SELECT_WRITABLE_BITS,
            counter_status_bits,
        })
    }

    /// Probe the hardware this kernel booted on.
    pub fn probe<H: PerfmonHw>(hw: &H) -> Option<HardwareCaps> {
        let leaf = hw.cpuid(X86_CPUID_PERFORMANCE_MONITORING, 0)?;
        let mut caps = HardwareCaps::from_leaf(leaf)?;

        // IA32_PERF_CAPABILITIES exists iff cpuid.01H reports PDCM.
        const X86_FEATURE_PDCM: u32 = 1 << 15;
        if let Some(leaf1) = hw.cpuid(1, 0) {
            if leaf1.c & X86_FEATURE_PDCM != 0 {
                caps.capabilities = hw.read_msr(IA32_PERF_CAPABILITIES) as u32;
            }
        }

        Some(caps)
    }
}

fn max_counter_value(width: u32) -> u64 {
    if width < 64 {
        (1u64 << width) - 1
    } else {
        !0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // cpuid.0AH as a Skylake-ish part reports it: version 4, 4 programmable
    // counters 48 bits wide, 3 fixed counters 48 bits wide.
    fn skylake_leaf() -> CpuidLeaf {
        CpuidLeaf {
            a: 4 | (4 << 8) | (48 << 16) | (7 << 24),
            b: 0,
            c: 0,
            d: 3 | (48 << 5),
        }
    }

    #[test]
    fn derives_counts_and_maxima() {
        let caps = HardwareCaps::from_leaf(skylake_leaf()).unwrap();
        assert_eq!(caps.version, 4);
        assert_eq!(caps.num_programmable, 4);
        assert_eq!(caps.num_fixed, 3);
        assert_eq!(caps.max_programmable_value, (1 << 48) - 1);
        assert_eq!(caps.max_fixed_value, (1 << 48) - 1);
    }

    #[test]
    fn derives_writable_masks() {
        let caps = HardwareCaps::from_leaf(skylake_leaf()).unwrap();
        assert_eq!(caps.global_ctrl_writable, 0xf | (0x7 << 32));
        // EN | ANY | PMI per fixed counter.
        assert_eq!(caps.fixed_ctrl_writable, 0xfff);
        assert_eq!(caps.counter_status_bits, 0xf | (0x7 << 32));
        assert_eq!(caps.event_select_writable, EVENT_SELECT_WRITABLE_BITS);
        #[cfg(not(feature = "freeze-on-pmi"))]
        assert_eq!(caps.debug_ctrl_writable, 0);
    }

    #[test]
    fn width_64_counter_max_is_all_ones() {
        let mut leaf = skylake_leaf();
        leaf.a = 4 | (4 << 8) | (64 << 16) | (7 << 24);
        let caps = HardwareCaps::from_leaf(leaf).unwrap();
        assert_eq!(caps.max_programmable_value, !0);
    }

    #[test]
    fn rejects_old_versions() {
        let mut leaf = skylake_leaf();
        leaf.a = (leaf.a & !0xff) | 3;
        assert!(HardwareCaps::from_leaf(leaf).is_none());
    }

    #[test]
    fn rejects_bogus_widths() {
        let mut leaf = skylake_leaf();
        leaf.a = 4 | (4 << 8) | (15 << 16) | (7 << 24);
        assert!(HardwareCaps::from_leaf(leaf).is_none());

        let mut leaf = skylake_leaf();
        leaf.d = 3 | (65 << 5);
        assert!(HardwareCaps::from_leaf(leaf).is_none());
    }

    #[test]
    fn rejects_counts_beyond_compile_time_maxima() {
        let mut leaf = skylake_leaf();
        leaf.a = 4 | (200 << 8) | (48 << 16) | (7 << 24);
        assert!(HardwareCaps::from_leaf(leaf).is_none());

        let mut leaf = skylake_leaf();
        leaf.d = 31 | (48 << 5);
        assert!(HardwareCaps::from_leaf(leaf).is_none());
    }

    #[test]
    fn masks_unsupported_events_to_reported_length() {
        let mut leaf = skylake_leaf();
        leaf.a = 4 | (4 << 8) | (48 << 16) | (3 << 24);
        leaf.b = 0xff;
        let caps = HardwareCaps::from_leaf(leaf).unwrap();
        assert_eq!(caps.unsupported_events, 0x7);
    }
}
