// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Performance monitor MSR addresses and bit layouts
//!
//! Addresses and masks are from Intel SDM Vol 3, chapter 18. The `*_MASK`
//! functions take counter numbers because the layouts repeat per counter.

/// CPUID leaf for performance monitoring enumeration.
pub const X86_CPUID_PERFORMANCE_MONITORING: u32 = 0xa;

pub const IA32_PERF_CAPABILITIES: u32 = 0x345;

/// The programmable counter MSR addresses are contiguous from here.
pub const IA32_PMC_FIRST: u32 = 0x0c1;
/// The event selection MSR addresses are contiguous from here.
pub const IA32_PERFEVTSEL_FIRST: u32 = 0x186;

pub const IA32_FIXED_CTR_CTRL: u32 = 0x38d;

/// The fixed counter MSR addresses are contiguous from here.
pub const IA32_FIXED_CTR0: u32 = 0x309;

pub const IA32_PERF_GLOBAL_CTRL: u32 = 0x38f;
pub const IA32_PERF_GLOBAL_STATUS: u32 = 0x38e;
pub const IA32_PERF_GLOBAL_OVF_CTRL: u32 = 0x390;
/// Same address as OVF_CTRL; v4 renamed it.
pub const IA32_PERF_GLOBAL_STATUS_RESET: u32 = 0x390;
pub const IA32_PERF_GLOBAL_STATUS_SET: u32 = 0x391;
pub const IA32_PERF_GLOBAL_INUSE: u32 = 0x392;

pub const IA32_DEBUGCTL: u32 = 0x1d9;

/// ============================================================================
/// IA32_PERFEVTSELx
/// ============================================================================

pub const IA32_PERFEVTSEL_EVENT_SELECT_MASK: u64 = 0xff;
pub const IA32_PERFEVTSEL_UMASK_MASK: u64 = 0xff << 8;
pub const IA32_PERFEVTSEL_USR_MASK: u64 = 1 << 16;
pub const IA32_PERFEVTSEL_OS_MASK: u64 = 1 << 17;
pub const IA32_PERFEVTSEL_E_MASK: u64 = 1 << 18;
pub const IA32_PERFEVTSEL_PC_MASK: u64 = 1 << 19;
pub const IA32_PERFEVTSEL_INT_MASK: u64 = 1 << 20;
pub const IA32_PERFEVTSEL_ANY_MASK: u64 = 1 << 21;
pub const IA32_PERFEVTSEL_EN_MASK: u64 = 1 << 22;
pub const IA32_PERFEVTSEL_INV_MASK: u64 = 1 << 23;
pub const IA32_PERFEVTSEL_CMASK_MASK: u64 = 0xff << 24;

/// ============================================================================
/// IA32_FIXED_CTR_CTRL
/// ============================================================================

/// Enable bits (OS and USR) for fixed counter `ctr`.
pub const fn ia32_fixed_ctr_ctrl_en_mask(ctr: u32) -> u64 {
    3 << (ctr * 4)
}

/// Any-thread bit for fixed counter `ctr`.
pub const fn ia32_fixed_ctr_ctrl_any_mask(ctr: u32) -> u64 {
    1 << (ctr * 4 + 2)
}

/// PMI-enable bit for fixed counter `ctr`.
pub const fn ia32_fixed_ctr_ctrl_pmi_mask(ctr: u32) -> u64 {
    1 << (ctr * 4 + 3)
}

/// ============================================================================
/// IA32_PERF_GLOBAL_CTRL
/// ============================================================================

pub const fn ia32_perf_global_ctrl_pmc_en_mask(ctr: u32) -> u64 {
    1 << ctr
}

pub const fn ia32_perf_global_ctrl_fixed_en_mask(ctr: u32) -> u64 {
    1 << (32 + ctr)
}

/// ============================================================================
/// IA32_PERF_GLOBAL_STATUS / OVF_CTRL
/// ============================================================================

pub const fn ia32_perf_global_status_pmc_ovf_mask(ctr: u32) -> u64 {
    1 << ctr
}

pub const fn ia32_perf_global_status_fixed_ovf_mask(ctr: u32) -> u64 {
    1 << (32 + ctr)
}

pub const IA32_PERF_GLOBAL_STATUS_TRACE_TOPA_PMI_MASK: u64 = 1 << 55;
pub const IA32_PERF_GLOBAL_STATUS_LBR_FRZ_MASK: u64 = 1 << 58;
pub const IA32_PERF_GLOBAL_STATUS_CTR_FRZ_MASK: u64 = 1 << 59;
pub const IA32_PERF_GLOBAL_STATUS_ASCI_MASK: u64 = 1 << 60;
pub const IA32_PERF_GLOBAL_STATUS_UNCORE_OVF_MASK: u64 = 1 << 61;
pub const IA32_PERF_GLOBAL_STATUS_DS_BUFFER_OVF_MASK: u64 = 1 << 62;
pub const IA32_PERF_GLOBAL_STATUS_COND_CHGD_MASK: u64 = 1 << 63;

// OVF_CTRL clear bits mirror the status bits.
pub const fn ia32_perf_global_ovf_ctrl_pmc_clr_ovf_mask(ctr: u32) -> u64 {
    ia32_perf_global_status_pmc_ovf_mask(ctr)
}

pub const fn ia32_perf_global_ovf_ctrl_fixed_ctr_clr_ovf_mask(ctr: u32) -> u64 {
    ia32_perf_global_status_fixed_ovf_mask(ctr)
}

pub const IA32_PERF_GLOBAL_OVF_CTRL_UNCORE_CLR_OVF_MASK: u64 =
    IA32_PERF_GLOBAL_STATUS_UNCORE_OVF_MASK;
pub const IA32_PERF_GLOBAL_OVF_CTRL_DS_BUFFER_CLR_OVF_MASK: u64 =
    IA32_PERF_GLOBAL_STATUS_DS_BUFFER_OVF_MASK;
pub const IA32_PERF_GLOBAL_OVF_CTRL_CLR_COND_CHGD_MASK: u64 =
    IA32_PERF_GLOBAL_STATUS_COND_CHGD_MASK;

/// ============================================================================
/// IA32_DEBUGCTL
/// ============================================================================

pub const IA32_DEBUGCTL_LBR_MASK: u64 = 1 << 0;
pub const IA32_DEBUGCTL_BTF_MASK: u64 = 1 << 1;
pub const IA32_DEBUGCTL_TR_MASK: u64 = 1 << 6;
pub const IA32_DEBUGCTL_BTS_MASK: u64 = 1 << 7;
pub const IA32_DEBUGCTL_BTINT_MASK: u64 = 1 << 8;
pub const IA32_DEBUGCTL_BTS_OFF_OS_MASK: u64 = 1 << 9;
pub const IA32_DEBUGCTL_BTS_OFF_USR_MASK: u64 = 1 << 10;
pub const IA32_DEBUGCTL_FREEZE_LBRS_ON_PMI_MASK: u64 = 1 << 11;
pub const IA32_DEBUGCTL_FREEZE_PERFMON_ON_PMI_MASK: u64 = 1 << 12;
pub const IA32_DEBUGCTL_FREEZE_WHILE_SMM_EN_MASK: u64 = 1 << 14;
pub const IA32_DEBUGCTL_RTM_MASK: u64 = 1 << 15;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_ctrl_fields_do_not_overlap() {
        for ctr in 0..4 {
            let en = ia32_fixed_ctr_ctrl_en_mask(ctr);
            let any = ia32_fixed_ctr_ctrl_any_mask(ctr);
            let pmi = ia32_fixed_ctr_ctrl_pmi_mask(ctr);
            assert_eq!(en & any, 0);
            assert_eq!(en & pmi, 0);
            assert_eq!(any & pmi, 0);
            assert_eq!((en | any | pmi), 0xf << (ctr * 4));
        }
    }

    #[test]
    fn global_ctrl_fixed_bits_start_at_32() {
        assert_eq!(ia32_perf_global_ctrl_pmc_en_mask(0), 1);
        assert_eq!(ia32_perf_global_ctrl_fixed_en_mask(0), 1 << 32);
        assert_eq!(ia32_perf_global_ctrl_fixed_en_mask(2), 1 << 34);
    }

    #[test]
    fn status_reset_aliases_ovf_ctrl() {
        assert_eq!(IA32_PERF_GLOBAL_STATUS_RESET, IA32_PERF_GLOBAL_OVF_CTRL);
    }
}
